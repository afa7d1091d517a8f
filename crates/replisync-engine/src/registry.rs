//! Entity types ordered by key dependency.
//!
//! There is an edge A -> B when B's key embeds a reference to A; A must be
//! synchronized first so B's key can be rebuilt on the destination. The order
//! is computed once when the registry is built.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use replisync_store::{EntitySchema, Schema, TypeName};

use crate::error::SyncError;

/// Schema types in key-dependency order.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    ordered: Vec<EntitySchema>,
    by_tag: HashMap<u32, usize>,
    by_name: HashMap<TypeName, usize>,
}

impl TypeRegistry {
    /// Topologically sorts the schema. Ties are broken by type tag.
    pub fn build(schema: &Schema) -> Result<Self, SyncError> {
        let mut indegree: BTreeMap<u32, usize> = BTreeMap::new();
        let mut dependents: HashMap<u32, Vec<u32>> = HashMap::new();
        let mut by_tag_schema: HashMap<u32, &EntitySchema> = HashMap::new();

        for ty in schema.types() {
            by_tag_schema.insert(ty.type_tag, ty);
            indegree.entry(ty.type_tag).or_insert(0);
        }
        for ty in schema.types() {
            let targets: BTreeSet<u32> = ty
                .key_references()
                .filter_map(|(_, f)| f.reference_target())
                .map(|target| schema.get(target).map(|t| t.type_tag))
                .collect::<Result<_, _>>()?;
            for target in targets {
                dependents.entry(target).or_default().push(ty.type_tag);
                *indegree.entry(ty.type_tag).or_insert(0) += 1;
            }
        }

        let mut ready: BTreeSet<u32> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(tag, _)| *tag)
            .collect();
        let mut ordered = Vec::with_capacity(indegree.len());
        while let Some(tag) = ready.pop_first() {
            if let Some(ty) = by_tag_schema.get(&tag) {
                ordered.push((*ty).clone());
            }
            for dependent in dependents.get(&tag).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(dependent) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if ordered.len() != indegree.len() {
            let placed: BTreeSet<u32> = ordered.iter().map(|t| t.type_tag).collect();
            let types = indegree
                .keys()
                .filter(|tag| !placed.contains(tag))
                .filter_map(|tag| by_tag_schema.get(tag))
                .map(|t| t.name.to_string())
                .collect();
            return Err(SyncError::CyclicKeyDependency { types });
        }

        let by_tag = ordered
            .iter()
            .enumerate()
            .map(|(i, t)| (t.type_tag, i))
            .collect();
        let by_name = ordered
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();
        Ok(Self {
            ordered,
            by_tag,
            by_name,
        })
    }

    /// Types in synchronization order.
    pub fn ordered(&self) -> &[EntitySchema] {
        &self.ordered
    }

    /// Looks up a type by tag.
    pub fn by_tag(&self, tag: u32) -> Result<&EntitySchema, SyncError> {
        self.by_tag
            .get(&tag)
            .map(|i| &self.ordered[*i])
            .ok_or(SyncError::UnknownTypeTag(tag))
    }

    /// Looks up a type by name.
    pub fn by_name(&self, name: &TypeName) -> Result<&EntitySchema, SyncError> {
        self.by_name
            .get(name)
            .map(|i| &self.ordered[*i])
            .ok_or_else(|| SyncError::UnknownType(name.to_string()))
    }

    /// Position of a type in synchronization order.
    pub fn position(&self, name: &TypeName) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// True if the schema declares no types.
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replisync_store::FieldDef;

    #[test]
    fn test_key_dependencies_come_first() {
        // Chapter's key embeds Book, Book's key is generated.
        let schema = Schema::new(vec![
            EntitySchema::assigned(
                "Chapter",
                1,
                vec![FieldDef::reference("book", "Book"), FieldDef::scalar("number")],
            ),
            EntitySchema::generated("Book", 5).with_field(FieldDef::reference("author", "Author")),
            EntitySchema::generated("Author", 9),
        ])
        .unwrap();
        let registry = TypeRegistry::build(&schema).unwrap();
        let names: Vec<_> = registry.ordered().iter().map(|t| t.name.as_str()).collect();
        // Non-key references do not constrain order; ties break by tag.
        assert_eq!(names, vec!["Book", "Chapter", "Author"]);
        assert_eq!(registry.position(&TypeName::from("Chapter")), Some(1));
        assert_eq!(registry.by_tag(9).unwrap().name.as_str(), "Author");
    }

    #[test]
    fn test_cycle_rejected() {
        let schema = Schema::new(vec![
            EntitySchema::assigned("A", 1, vec![FieldDef::reference("b", "B")]),
            EntitySchema::assigned("B", 2, vec![FieldDef::reference("a", "A")]),
            EntitySchema::generated("C", 3),
        ])
        .unwrap();
        match TypeRegistry::build(&schema) {
            Err(SyncError::CyclicKeyDependency { types }) => assert_eq!(types, vec!["A", "B"]),
            other => panic!("expected cycle, got {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn test_self_reference_in_key_is_a_cycle() {
        let schema = Schema::new(vec![EntitySchema::assigned(
            "Node",
            1,
            vec![FieldDef::reference("parent", "Node")],
        )])
        .unwrap();
        assert!(matches!(
            TypeRegistry::build(&schema),
            Err(SyncError::CyclicKeyDependency { .. })
        ));
    }

    #[test]
    fn test_unknown_lookups() {
        let schema = Schema::new(vec![EntitySchema::generated("A", 1)]).unwrap();
        let registry = TypeRegistry::build(&schema).unwrap();
        assert!(matches!(registry.by_tag(2), Err(SyncError::UnknownTypeTag(2))));
        assert!(matches!(
            registry.by_name(&TypeName::from("Z")),
            Err(SyncError::UnknownType(_))
        ));
    }
}
