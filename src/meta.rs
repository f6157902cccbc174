//! Type repository — the fixed schema side of the store.
//!
//! Defines [`ItemType`] (plain items and associations), [`AttributeDef`] (row
//! attributes and reference attributes with their three resolution axes plus
//! deletion policy), and [`TypeRepository`] with a programmatic builder. The
//! schema loader of the full product is an external collaborator; the builder
//! is the in-crate stand-in used by applications and tests.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, StrataError};

/// Name of the source end attribute on association types.
pub const ASSOC_SOURCE: &str = "source";
/// Name of the destination end attribute on association types.
pub const ASSOC_DEST: &str = "dest";

/// Runtime kind of an attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    String,
    Timestamp,
    Ref,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Timestamp => "timestamp",
            Self::Ref => "ref",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a reference re-resolves its target over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryType {
    /// Always re-resolves to the current version of the target, even when the
    /// holder itself is viewed historically.
    Current,
    /// Stabilizes to the target's revision when the reference is committed
    /// and never changes afterwards.
    Historic,
    /// Current while the holder is current; once the holder is viewed in a
    /// past revision, resolves the target as of the holder's queried revision.
    Mixed,
}

/// Whether a reference may point across branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchScope {
    /// The target carries its own branch; resolution crosses branches.
    Global,
    /// The target lives on the holder's branch. May only be set to an item
    /// visible on that branch (same branch, or shining through from the base
    /// at or before the fork point).
    Local,
}

/// What happens to the referer when the referenced item is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionPolicy {
    /// The referer's attribute is set to null.
    ClearReference,
    /// The referer is deleted along with the target.
    DeleteReferer,
    /// The deletion fails with an identity error.
    Veto,
}

impl DeletionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClearReference => "clear-reference",
            Self::DeleteReferer => "delete-referer",
            Self::Veto => "veto",
        }
    }
}

impl fmt::Display for DeletionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target-type axis of a reference attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetType {
    /// Target type is fixed; only items of exactly this type are accepted.
    Mono(String),
    /// Target type is recorded alongside the key; any item type is accepted.
    Poly,
}

impl TargetType {
    /// Whether an item of `type_name` is an acceptable target.
    pub fn accepts(&self, type_name: &str) -> bool {
        match self {
            Self::Mono(t) => t == type_name,
            Self::Poly => true,
        }
    }
}

/// Full axis specification of a reference attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSpec {
    pub target: TargetType,
    pub history: HistoryType,
    pub scope: BranchScope,
    pub policy: DeletionPolicy,
}

impl ReferenceSpec {
    /// Monomorphic reference to `target_type`, current, branch-global,
    /// clear-reference on target deletion.
    pub fn to(target_type: &str) -> Self {
        Self {
            target: TargetType::Mono(target_type.to_string()),
            history: HistoryType::Current,
            scope: BranchScope::Global,
            policy: DeletionPolicy::ClearReference,
        }
    }

    /// Polymorphic reference, current, branch-global, clear-reference.
    pub fn poly() -> Self {
        Self {
            target: TargetType::Poly,
            history: HistoryType::Current,
            scope: BranchScope::Global,
            policy: DeletionPolicy::ClearReference,
        }
    }

    pub fn historic(mut self) -> Self {
        self.history = HistoryType::Historic;
        self
    }

    pub fn mixed(mut self) -> Self {
        self.history = HistoryType::Mixed;
        self
    }

    pub fn branch_local(mut self) -> Self {
        self.scope = BranchScope::Local;
        self
    }

    pub fn on_delete(mut self, policy: DeletionPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Declared shape of a single attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeKind {
    /// Fixed-schema row attribute holding a plain value.
    Plain(ValueKind),
    /// Reference attribute holding a key to another item.
    Reference(ReferenceSpec),
}

/// A declared (row or reference) attribute. Flex attributes are never
/// declared — anything not named here is flex.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDef {
    pub name: String,
    pub kind: AttributeKind,
    /// Must be non-null at commit. Only meaningful for declared attributes.
    pub mandatory: bool,
    /// Value must be unique among alive items of the type. Row attributes only.
    pub unique: bool,
}

impl AttributeDef {
    pub fn reference_spec(&self) -> Option<&ReferenceSpec> {
        match &self.kind {
            AttributeKind::Reference(spec) => Some(spec),
            AttributeKind::Plain(_) => None,
        }
    }
}

/// A declared item type: plain object type or association type.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemType {
    pub name: String,
    /// Unversioned types exist only in current state and leave no history.
    pub versioned: bool,
    /// Association types carry the `source` / `dest` reference ends.
    pub is_association: bool,
    attributes: BTreeMap<String, AttributeDef>,
}

impl ItemType {
    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> impl Iterator<Item = &AttributeDef> {
        self.attributes.values()
    }

    /// Declared reference attributes, association ends included.
    pub fn references(&self) -> impl Iterator<Item = (&str, &ReferenceSpec)> {
        self.attributes.values().filter_map(|a| match &a.kind {
            AttributeKind::Reference(spec) => Some((a.name.as_str(), spec)),
            AttributeKind::Plain(_) => None,
        })
    }
}

/// Immutable set of all declared types, shared by every handle of a store.
#[derive(Debug, Clone)]
pub struct TypeRepository {
    types: BTreeMap<String, Arc<ItemType>>,
}

impl TypeRepository {
    pub fn builder() -> TypeRepositoryBuilder {
        TypeRepositoryBuilder { types: Vec::new() }
    }

    /// Look up a type; unknown names are a schema error.
    pub fn get(&self, name: &str) -> Result<&Arc<ItemType>> {
        self.types
            .get(name)
            .ok_or_else(|| StrataError::UnknownType(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ItemType>> {
        self.types.values()
    }

    /// All type names, in lexical order.
    pub fn names(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }
}

/// Fluent single-type builder. `mandatory()` / `unique()` apply to the most
/// recently added attribute.
pub struct TypeBuilder {
    name: String,
    versioned: bool,
    is_association: bool,
    attrs: Vec<AttributeDef>,
}

impl TypeBuilder {
    /// A plain, versioned item type.
    pub fn item(name: &str) -> Self {
        Self {
            name: name.to_string(),
            versioned: true,
            is_association: false,
            attrs: Vec::new(),
        }
    }

    /// An association type with the given end specifications. Deleting an
    /// endpoint always deletes the link, so the end policies are forced to
    /// [`DeletionPolicy::DeleteReferer`] no matter what the specs say.
    pub fn association(name: &str, source: ReferenceSpec, dest: ReferenceSpec) -> Self {
        let mut b = Self::item(name);
        b.is_association = true;
        b.attrs.push(AttributeDef {
            name: ASSOC_SOURCE.to_string(),
            kind: AttributeKind::Reference(source.on_delete(DeletionPolicy::DeleteReferer)),
            mandatory: true,
            unique: false,
        });
        b.attrs.push(AttributeDef {
            name: ASSOC_DEST.to_string(),
            kind: AttributeKind::Reference(dest.on_delete(DeletionPolicy::DeleteReferer)),
            mandatory: true,
            unique: false,
        });
        b
    }

    /// Mark the type unversioned: current state only, no history.
    pub fn unversioned(mut self) -> Self {
        self.versioned = false;
        self
    }

    pub fn plain(mut self, name: &str, kind: ValueKind) -> Self {
        self.attrs.push(AttributeDef {
            name: name.to_string(),
            kind: AttributeKind::Plain(kind),
            mandatory: false,
            unique: false,
        });
        self
    }

    pub fn reference(mut self, name: &str, spec: ReferenceSpec) -> Self {
        self.attrs.push(AttributeDef {
            name: name.to_string(),
            kind: AttributeKind::Reference(spec),
            mandatory: false,
            unique: false,
        });
        self
    }

    pub fn mandatory(mut self) -> Self {
        if let Some(last) = self.attrs.last_mut() {
            last.mandatory = true;
        }
        self
    }

    pub fn unique(mut self) -> Self {
        if let Some(last) = self.attrs.last_mut() {
            last.unique = true;
        }
        self
    }
}

pub struct TypeRepositoryBuilder {
    types: Vec<TypeBuilder>,
}

impl TypeRepositoryBuilder {
    pub fn ty(mut self, builder: TypeBuilder) -> Self {
        self.types.push(builder);
        self
    }

    /// Validate and freeze the repository. Monomorphic reference targets must
    /// name declared types; unique is restricted to plain row attributes.
    pub fn build(self) -> Result<TypeRepository> {
        let mut types = BTreeMap::new();
        for tb in &self.types {
            let mut attributes = BTreeMap::new();
            for attr in &tb.attrs {
                if attr.unique && matches!(attr.kind, AttributeKind::Reference(_)) {
                    return Err(StrataError::UniqueReference {
                        type_name: tb.name.clone(),
                        attribute: attr.name.clone(),
                    });
                }
                attributes.insert(attr.name.clone(), attr.clone());
            }
            types.insert(
                tb.name.clone(),
                Arc::new(ItemType {
                    name: tb.name.clone(),
                    versioned: tb.versioned,
                    is_association: tb.is_association,
                    attributes,
                }),
            );
        }
        // Mono targets must exist.
        for ty in types.values() {
            for (_, spec) in ty.references() {
                if let TargetType::Mono(target) = &spec.target {
                    if !types.contains_key(target.as_str()) {
                        return Err(StrataError::UnknownType(target.clone()));
                    }
                }
            }
        }
        Ok(TypeRepository { types })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_declares_association_ends() {
        let types = TypeRepository::builder()
            .ty(TypeBuilder::item("B").plain("a1", ValueKind::String))
            .ty(TypeBuilder::association(
                "AB",
                ReferenceSpec::to("B"),
                ReferenceSpec::to("B"),
            ))
            .build()
            .unwrap();

        let ab = types.get("AB").unwrap();
        assert!(ab.is_association);
        assert!(ab.attribute(ASSOC_SOURCE).unwrap().mandatory);
        assert!(ab.attribute(ASSOC_DEST).unwrap().mandatory);
        assert_eq!(ab.references().count(), 2);
        for (_, spec) in ab.references() {
            assert_eq!(spec.policy, DeletionPolicy::DeleteReferer);
        }
    }

    #[test]
    fn mono_target_must_be_declared() {
        let err = TypeRepository::builder()
            .ty(TypeBuilder::item("B").reference("r", ReferenceSpec::to("missing")))
            .build()
            .unwrap_err();
        assert!(matches!(err, StrataError::UnknownType(t) if t == "missing"));
    }

    #[test]
    fn unique_is_refused_on_reference_attributes() {
        let err = TypeRepository::builder()
            .ty(TypeBuilder::item("B")
                .reference("r", ReferenceSpec::to("B"))
                .unique())
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            StrataError::UniqueReference { ref type_name, ref attribute }
                if type_name == "B" && attribute == "r"
        ));
        assert_eq!(err.kind(), crate::error::ErrorKind::Schema);
    }

    #[test]
    fn unknown_type_lookup_is_schema_error() {
        let types = TypeRepository::builder().build().unwrap();
        let err = types.get("nope").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Schema);
    }

    #[test]
    fn reference_spec_axes_compose() {
        let spec = ReferenceSpec::poly()
            .mixed()
            .branch_local()
            .on_delete(DeletionPolicy::Veto);
        assert_eq!(spec.target, TargetType::Poly);
        assert_eq!(spec.history, HistoryType::Mixed);
        assert_eq!(spec.scope, BranchScope::Local);
        assert_eq!(spec.policy, DeletionPolicy::Veto);
    }
}
