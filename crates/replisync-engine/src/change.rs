//! Change descriptors and the payload that travels with them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use replisync_store::{EntityKey, FieldValue};

use crate::error::SyncError;
use crate::id::GlobalId;
use crate::knowledge::Version;

/// What a descriptor asks the destination to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Create or update the item.
    Update,
    /// Tombstone the item.
    Delete,
    /// The replica has no record of the item.
    UnknownItem,
}

/// Identity and versions of one changed item, without payload.
///
/// Versions are in the producing replica's key space. For deletes,
/// `change_version` is the tombstone version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDescriptor {
    /// Item identity.
    pub global_id: GlobalId,
    /// Requested action.
    pub kind: ChangeKind,
    /// Version that created the item.
    pub creation_version: Version,
    /// Version this change carries.
    pub change_version: Version,
}

impl ChangeDescriptor {
    /// Descriptor for an item the replica does not know.
    pub fn unknown(global_id: GlobalId) -> Self {
        Self {
            global_id,
            kind: ChangeKind::UnknownItem,
            creation_version: Version::local(0),
            change_version: Version::local(0),
        }
    }
}

/// Identity of a referenced entity as seen by the producing replica.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Global id, when the target has sync metadata.
    pub global_id: Option<GlobalId>,
    /// Local key on the producing replica.
    pub local_key: Option<EntityKey>,
}

impl Identity {
    /// A reference to an entity known only by its local key.
    pub fn local(key: EntityKey) -> Self {
        Self {
            global_id: None,
            local_key: Some(key),
        }
    }

    /// A null reference.
    pub fn none() -> Self {
        Self::default()
    }

    /// True for a null reference.
    pub fn is_none(&self) -> bool {
        self.global_id.is_none() && self.local_key.is_none()
    }
}

/// Payload of one live item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemChangeData {
    /// The descriptor this payload belongs to.
    pub descriptor: ChangeDescriptor,
    /// Key on the producing replica. `None` for deletes.
    pub key: Option<EntityKey>,
    /// Scalar non-key fields, sorted by name.
    pub fields: BTreeMap<String, FieldValue>,
    /// Every reference field, key-embedded or not, by field name.
    pub references: BTreeMap<String, Identity>,
}

impl ItemChangeData {
    /// Payload of a delete.
    pub fn deleted(descriptor: ChangeDescriptor) -> Self {
        Self {
            descriptor,
            key: None,
            fields: BTreeMap::new(),
            references: BTreeMap::new(),
        }
    }
}

/// Supplies payloads for the descriptors of a batch.
pub trait ChangeDataSource {
    /// Loads the payload of one descriptor.
    fn load_change_data(&self, descriptor: &ChangeDescriptor) -> Result<ItemChangeData, SyncError>;
}

/// Payloads collected while a batch was built.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDataRetriever {
    items: BTreeMap<GlobalId, ItemChangeData>,
}

impl ChangeDataRetriever {
    /// Empty retriever.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a payload.
    pub fn insert(&mut self, data: ItemChangeData) {
        self.items.insert(data.descriptor.global_id, data);
    }

    /// Payload of one item.
    pub fn get(&self, id: &GlobalId) -> Option<&ItemChangeData> {
        self.items.get(id)
    }

    /// Number of payloads.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if no payload is held.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl ChangeDataSource for ChangeDataRetriever {
    fn load_change_data(&self, descriptor: &ChangeDescriptor) -> Result<ItemChangeData, SyncError> {
        self.items
            .get(&descriptor.global_id)
            .cloned()
            .ok_or(SyncError::MissingChangeData(descriptor.global_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriever_lookup() {
        let id = GlobalId::new(1, 2, 3);
        let descriptor = ChangeDescriptor {
            global_id: id,
            kind: ChangeKind::Update,
            creation_version: Version::local(3),
            change_version: Version::local(3),
        };
        let mut retriever = ChangeDataRetriever::new();
        retriever.insert(ItemChangeData {
            descriptor: descriptor.clone(),
            key: Some(EntityKey::generated(1)),
            fields: BTreeMap::new(),
            references: BTreeMap::new(),
        });
        assert_eq!(retriever.len(), 1);
        assert_eq!(
            retriever.load_change_data(&descriptor).unwrap().key,
            Some(EntityKey::generated(1))
        );
        let missing = ChangeDescriptor::unknown(GlobalId::new(1, 2, 4));
        assert!(matches!(
            retriever.load_change_data(&missing),
            Err(SyncError::MissingChangeData(_))
        ));
    }

    #[test]
    fn test_identity_none() {
        assert!(Identity::none().is_none());
        assert!(!Identity::local(EntityKey::generated(1)).is_none());
    }
}
