//! Command line entry points.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;

use replisync_store::{
    ChangeLog, ChangeNotification, Entity, EntityKey, EntitySchema, EntityStore, FieldDef, FieldValue, KeyGeneration,
    MemoryStore, Schema, StoreError, TypeName,
};

use crate::applier::{ConflictPolicy, NoopCallbacks};
use crate::config::SyncConfig;
use crate::detector::SyncScope;
use crate::harness::{sync_once, SyncReport};
use crate::id::GlobalId;
use crate::maintenance::{MaintenanceHandle, MaintenanceWorker};
use crate::manager::MetadataManager;
use crate::provider::SyncProvider;

/// Top-level arguments.
#[derive(Parser)]
#[command(name = "replisync")]
#[command(about = "Replica synchronization engine", long_about = None)]
pub struct Cli {
    /// TOML or JSON engine configuration.
    #[arg(short, long, env = "REPLISYNC_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Populate two in-memory replicas and synchronize them both ways.
    Demo {
        /// Authors to create on the first replica.
        #[arg(short, long, default_value = "5")]
        items: usize,
        /// Overrides `default_conflict_policy` from the configuration.
        #[arg(short, long, value_enum)]
        policy: Option<PolicyArg>,
    },
    /// Print the parts of a hex global id.
    DecodeId {
        /// 32 hex digits.
        id: String,
    },
}

/// Conflict policy choices on the command line.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum PolicyArg {
    /// Incoming changes overwrite local edits.
    SourceWins,
    /// Local edits are kept.
    DestinationWins,
}

impl From<PolicyArg> for ConflictPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::SourceWins => ConflictPolicy::SourceWins,
            PolicyArg::DestinationWins => ConflictPolicy::DestinationWins,
        }
    }
}

impl Cli {
    /// Executes the selected subcommand.
    pub async fn run(self) -> Result<()> {
        let config = match &self.config {
            Some(path) => SyncConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => SyncConfig::default(),
        };
        match self.command {
            Command::Demo { items, policy } => {
                let policy = policy.map_or(config.default_conflict_policy, ConflictPolicy::from);
                demo(config, items, policy).await
            }
            Command::DecodeId { ref id } => decode_id(id),
        }
    }
}

#[derive(Serialize)]
struct DecodedId {
    type_tag: u32,
    fingerprint: String,
    tick: u64,
}

fn decode_id(text: &str) -> Result<()> {
    let id = GlobalId::from_hex(text)?;
    let (type_tag, fingerprint, tick) = id.decompose();
    let decoded = DecodedId {
        type_tag,
        fingerprint: format!("{:08x}", fingerprint),
        tick,
    };
    println!("{}", serde_json::to_string_pretty(&decoded)?);
    Ok(())
}

/// Author -> Book -> Chapter, where a chapter is keyed by (book, number).
pub fn library_schema() -> Result<Schema, StoreError> {
    Schema::new(vec![
        EntitySchema::generated("Author", 1).with_field(FieldDef::scalar("name")),
        EntitySchema::generated("Book", 2)
            .with_field(FieldDef::scalar("title"))
            .with_field(FieldDef::reference("author", "Author")),
        EntitySchema::assigned(
            "Chapter",
            3,
            vec![FieldDef::reference("book", "Book"), FieldDef::scalar("number")],
        )
        .with_field(FieldDef::scalar("title")),
    ])
}

struct DemoReplica {
    name: &'static str,
    store: Arc<MemoryStore>,
    provider: SyncProvider,
    maintenance: MaintenanceHandle,
}

impl DemoReplica {
    fn open(name: &'static str, config: &SyncConfig) -> Result<Self> {
        let store = Arc::new(MemoryStore::new(library_schema()?));
        let manager = Arc::new(MetadataManager::open(store.clone(), config.clone())?);
        let maintenance = MaintenanceWorker::start(manager.clone());
        Ok(Self {
            name,
            store,
            provider: SyncProvider::new(manager),
            maintenance,
        })
    }

    fn insert(&self, type_name: &str, key: Option<EntityKey>, fields: Vec<(&str, FieldValue)>) -> Result<EntityKey> {
        let type_name = TypeName::from(type_name);
        let key = self.store.create_entity(&type_name, key)?;
        let mut entity = Entity::new(type_name.clone(), key.clone());
        for (field, value) in fields {
            entity.set(field, value);
        }
        self.store.put_entity(&entity)?;
        ChangeLog::append(self.store.as_ref(), &[ChangeNotification::created(type_name, key.clone())])?;
        Ok(key)
    }

    fn populate(&self, items: usize) -> Result<usize> {
        const NAMES: &[&str] = &["Atwood", "Borges", "Calvino", "Duras", "Eco", "Frame"];
        const WORDS: &[&str] = &["Night", "River", "Glass", "Winter", "Garden", "Mirror"];
        let mut rng = rand::thread_rng();
        let mut written = 0;

        for i in 0..items {
            let name = NAMES.choose(&mut rng).copied().unwrap_or("Anonymous");
            let author = self.insert("Author", None, vec![("name", FieldValue::Text(format!("{} {}", name, i)))])?;
            let word = WORDS.choose(&mut rng).copied().unwrap_or("Untitled");
            let book = self.insert(
                "Book",
                None,
                vec![
                    ("title", FieldValue::Text(format!("{} of {}", word, self.name))),
                    ("author", FieldValue::Ref(author)),
                ],
            )?;
            written += 2;
            for number in 1..=rng.gen_range(1..=3) {
                let key = EntityKey::new(vec![FieldValue::Ref(book.clone()), FieldValue::Int(number)]);
                self.insert(
                    "Chapter",
                    Some(key),
                    vec![("title", FieldValue::Text(format!("Part {}", number)))],
                )?;
                written += 1;
            }
        }
        Ok(written)
    }

    async fn settle(&self, expected: u64) -> Result<()> {
        self.maintenance.notify_data_available();
        let mut stats = self.maintenance.subscribe_stats();
        stats
            .wait_for(|s| s.notifications_processed >= expected)
            .await
            .context("maintenance worker stopped")?;
        Ok(())
    }

    /// Entities rendered without local keys, so replicas can be compared.
    fn contents(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let mut contents = BTreeMap::new();
        for schema in self.store.schema().types() {
            let mut rendered: Vec<String> = self
                .store
                .query_all_ordered(&schema.name, None)?
                .iter()
                .map(|entity| render(schema, entity))
                .collect();
            rendered.sort();
            contents.insert(schema.name.to_string(), rendered);
        }
        Ok(contents)
    }
}

fn render(schema: &EntitySchema, entity: &Entity) -> String {
    // Generated keys differ between replicas; assigned ones carry data.
    let key_parts: &[FieldValue] = match schema.key_generation {
        KeyGeneration::Assigned => entity.key.parts(),
        KeyGeneration::Generated => &[],
    };
    let scalars = key_parts
        .iter()
        .chain(entity.fields.values())
        .filter(|v| v.as_ref_key().is_none())
        .map(|v| v.to_string())
        .collect::<Vec<_>>();
    scalars.join("|")
}

#[derive(Serialize)]
struct DemoReport {
    passes: Vec<SyncReport>,
    counts: BTreeMap<String, BTreeMap<String, usize>>,
    converged: bool,
}

async fn demo(config: SyncConfig, items: usize, policy: ConflictPolicy) -> Result<()> {
    let mut a = DemoReplica::open("A", &config)?;
    let mut b = DemoReplica::open("B", &config)?;

    let written_a = a.populate(items)?;
    let written_b = b.populate(items / 2 + 1)?;
    a.settle(written_a as u64).await?;
    b.settle(written_b as u64).await?;

    let scope = SyncScope::from_config(&config);
    let passes = vec![
        sync_once(&mut a.provider, &mut b.provider, policy, scope.clone(), &mut NoopCallbacks)?,
        sync_once(&mut b.provider, &mut a.provider, policy, scope.clone(), &mut NoopCallbacks)?,
        sync_once(&mut a.provider, &mut b.provider, policy, scope, &mut NoopCallbacks)?,
    ];

    let contents_a = a.contents()?;
    let contents_b = b.contents()?;
    let mut counts = BTreeMap::new();
    for (replica, contents) in [(a.name, &contents_a), (b.name, &contents_b)] {
        counts.insert(
            replica.to_string(),
            contents.iter().map(|(t, rows)| (t.clone(), rows.len())).collect(),
        );
    }
    let report = DemoReport {
        passes,
        counts,
        converged: contents_a == contents_b,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    for replica in [a, b] {
        let stats = replica.maintenance.shutdown().await?;
        tracing::debug!(replica = replica.name, cycles = stats.cycles, "maintenance stopped");
    }
    Ok(())
}
