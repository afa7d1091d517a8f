//! Entity type declarations.
//!
//! A schema lists every entity type with its type tag, how its keys are
//! produced, and which fields reference other types. Key fields may
//! themselves be references, which is what makes one type's identity depend
//! on another's.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::StoreError;
use crate::types::TypeName;

/// Kind of a field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    /// Plain value.
    Scalar,
    /// Reference to an entity of the named type.
    Reference(TypeName),
}

/// A declared field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name.
    pub name: String,
    /// Field kind.
    pub kind: FieldKind,
}

impl FieldDef {
    /// Declares a scalar field.
    pub fn scalar(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Scalar,
        }
    }

    /// Declares a reference field pointing at `target`.
    pub fn reference(name: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Reference(TypeName::from(target)),
        }
    }

    /// Returns the referenced type for reference fields.
    pub fn reference_target(&self) -> Option<&TypeName> {
        match &self.kind {
            FieldKind::Reference(target) => Some(target),
            FieldKind::Scalar => None,
        }
    }
}

/// How local keys are produced for a type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyGeneration {
    /// The store mints a fresh integer key.
    Generated,
    /// The key is the tuple of the declared key fields.
    Assigned,
}

/// Declaration of one entity type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    /// Type name.
    pub name: TypeName,
    /// Type tag embedded in global ids.
    pub type_tag: u32,
    /// Key production mode.
    pub key_generation: KeyGeneration,
    /// Key fields, in key tuple order. Empty for generated keys.
    pub key_fields: Vec<FieldDef>,
    /// Non-key fields.
    pub fields: Vec<FieldDef>,
}

impl EntitySchema {
    /// Declares a type whose keys are generated by the store.
    pub fn generated(name: &str, type_tag: u32) -> Self {
        Self {
            name: TypeName::from(name),
            type_tag,
            key_generation: KeyGeneration::Generated,
            key_fields: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// Declares a type whose key is the tuple of `key_fields`.
    pub fn assigned(name: &str, type_tag: u32, key_fields: Vec<FieldDef>) -> Self {
        Self {
            name: TypeName::from(name),
            type_tag,
            key_generation: KeyGeneration::Assigned,
            key_fields,
            fields: Vec::new(),
        }
    }

    /// Adds a non-key field.
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Number of parts in a key of this type.
    pub fn key_arity(&self) -> usize {
        match self.key_generation {
            KeyGeneration::Generated => 1,
            KeyGeneration::Assigned => self.key_fields.len(),
        }
    }

    /// Looks up a non-key field.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Non-key reference fields.
    pub fn reference_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.reference_target().is_some())
    }

    /// Key fields that embed a reference, with their position in the key tuple.
    pub fn key_references(&self) -> impl Iterator<Item = (usize, &FieldDef)> {
        self.key_fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.reference_target().is_some())
    }
}

/// The set of entity types known to a store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    types: BTreeMap<TypeName, EntitySchema>,
}

impl Schema {
    /// Builds a schema, rejecting duplicate names/tags and dangling references.
    pub fn new(types: Vec<EntitySchema>) -> Result<Self, StoreError> {
        let mut by_name = BTreeMap::new();
        let mut tags: HashMap<u32, TypeName> = HashMap::new();

        for ty in types {
            if let Some(first) = tags.get(&ty.type_tag) {
                return Err(StoreError::DuplicateTypeTag {
                    tag: ty.type_tag,
                    first: first.to_string(),
                    second: ty.name.to_string(),
                });
            }
            tags.insert(ty.type_tag, ty.name.clone());
            if by_name.contains_key(&ty.name) {
                return Err(StoreError::DuplicateType(ty.name.to_string()));
            }
            by_name.insert(ty.name.clone(), ty);
        }

        for ty in by_name.values() {
            for field in ty.key_fields.iter().chain(ty.fields.iter()) {
                if let Some(target) = field.reference_target() {
                    if !by_name.contains_key(target) {
                        return Err(StoreError::DanglingReference {
                            type_name: ty.name.to_string(),
                            field: field.name.clone(),
                            target: target.to_string(),
                        });
                    }
                }
            }
        }

        Ok(Self { types: by_name })
    }

    /// Looks up a type by name.
    pub fn get(&self, name: &TypeName) -> Result<&EntitySchema, StoreError> {
        self.types
            .get(name)
            .ok_or_else(|| StoreError::UnknownType(name.to_string()))
    }

    /// Iterates types in name order.
    pub fn types(&self) -> impl Iterator<Item = &EntitySchema> {
        self.types.values()
    }

    /// Number of declared types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns true if no types are declared.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library() -> Vec<EntitySchema> {
        vec![
            EntitySchema::generated("Author", 1).with_field(FieldDef::scalar("name")),
            EntitySchema::generated("Book", 2)
                .with_field(FieldDef::scalar("title"))
                .with_field(FieldDef::reference("author", "Author")),
            EntitySchema::assigned(
                "Chapter",
                3,
                vec![FieldDef::reference("book", "Book"), FieldDef::scalar("number")],
            ),
        ]
    }

    #[test]
    fn test_schema_builds() {
        let schema = Schema::new(library()).unwrap();
        assert_eq!(schema.len(), 3);
        let chapter = schema.get(&TypeName::from("Chapter")).unwrap();
        assert_eq!(chapter.key_arity(), 2);
        assert_eq!(chapter.key_references().count(), 1);
        let book = schema.get(&TypeName::from("Book")).unwrap();
        assert_eq!(book.key_arity(), 1);
        assert_eq!(book.reference_fields().count(), 1);
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let mut types = library();
        types.push(EntitySchema::generated("Shelf", 2));
        assert!(matches!(
            Schema::new(types),
            Err(StoreError::DuplicateTypeTag { tag: 2, .. })
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut types = library();
        types.push(EntitySchema::generated("Author", 9));
        assert!(matches!(Schema::new(types), Err(StoreError::DuplicateType(_))));
    }

    #[test]
    fn test_dangling_reference_rejected() {
        let types = vec![EntitySchema::generated("Book", 2)
            .with_field(FieldDef::reference("publisher", "Publisher"))];
        assert!(matches!(
            Schema::new(types),
            Err(StoreError::DanglingReference { .. })
        ));
    }

    #[test]
    fn test_unknown_type_lookup() {
        let schema = Schema::new(library()).unwrap();
        assert!(matches!(
            schema.get(&TypeName::from("Nope")),
            Err(StoreError::UnknownType(_))
        ));
    }
}
