//! Ledger store: the narrow repository interface and its RocksDB backend
//!
//! # Column Families
//!
//! - `requisitions` - Requisitions (key: requisition_id)
//! - `deliveries` - Deliveries (key: delivery_id)
//! - `status` - Status history (key: requisition_id || sequence)
//! - `tags` - Tag catalogue (key: tag name)
//! - `directory` - Institutes, departments, profiles, projects (key: kind || id)
//! - `indices` - Secondary indices for protocol, slug and per-requisition lookups
//!
//! Every mutation goes through [`LedgerStore::commit`], which applies a
//! whole [`WriteSet`] or nothing.

use crate::{
    error::{Error, Result},
    types::{
        Delivery, Department, Institute, Profile, Project, Protocol, Requisition, StatusEvent,
        Tag,
    },
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    WriteBatch, DB,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_REQUISITIONS: &str = "requisitions";
const CF_DELIVERIES: &str = "deliveries";
const CF_STATUS: &str = "status";
const CF_TAGS: &str = "tags";
const CF_DIRECTORY: &str = "directory";
const CF_INDICES: &str = "indices";

/// Directory key kinds
const KIND_INSTITUTE: u8 = b'i';
const KIND_DEPARTMENT: u8 = b'd';
const KIND_PROFILE: u8 = b'p';
const KIND_PROJECT: u8 = b'j';

/// Index key kinds
const IDX_PROTOCOL: u8 = b'p';
const IDX_DELIVERY: u8 = b'd';
const IDX_SLUG: u8 = b's';

/// Repository interface the core reads and writes through
pub trait LedgerStore: Send + Sync {
    /// Requisition by ID
    fn get_requisition(&self, id: Uuid) -> Result<Requisition>;

    /// Requisition by protocol
    fn find_requisition(&self, protocol: &Protocol) -> Result<Option<Requisition>>;

    /// Delivery by ID
    fn get_delivery(&self, id: Uuid) -> Result<Delivery>;

    /// All deliveries of a requisition, active or not, in recording order
    fn requisition_deliveries(&self, requisition_id: Uuid) -> Result<Vec<Delivery>>;

    /// Status history of a requisition, in sequence order
    fn status_history(&self, requisition_id: Uuid) -> Result<Vec<StatusEvent>>;

    /// Tag by name
    fn get_tag(&self, name: &str) -> Result<Option<Tag>>;

    /// Tag catalogue, ordered by name
    fn list_tags(&self) -> Result<Vec<Tag>>;

    /// Project by ID
    fn get_project(&self, id: Uuid) -> Result<Project>;

    /// Project by slug
    fn find_project_by_slug(&self, slug: &str) -> Result<Option<Project>>;

    /// Profile by ID
    fn get_profile(&self, id: Uuid) -> Result<Profile>;

    /// Institute by ID
    fn get_institute(&self, id: Uuid) -> Result<Institute>;

    /// Department by ID
    fn get_department(&self, id: Uuid) -> Result<Department>;

    /// Everything the statistics aggregator needs, read at one point in time
    fn snapshot(&self) -> Result<LedgerSnapshot>;

    /// Apply a write set atomically
    fn commit(&self, set: WriteSet) -> Result<()>;
}

/// Records to be written together
#[derive(Debug, Clone, Default)]
pub struct WriteSet {
    /// Requisitions (insert or replace)
    pub requisitions: Vec<Requisition>,
    /// Deliveries (insert or replace)
    pub deliveries: Vec<Delivery>,
    /// Status events (append)
    pub status_events: Vec<StatusEvent>,
    /// Tags (insert or replace)
    pub tags: Vec<Tag>,
    /// Institutes
    pub institutes: Vec<Institute>,
    /// Departments
    pub departments: Vec<Department>,
    /// Profiles
    pub profiles: Vec<Profile>,
    /// Projects
    pub projects: Vec<Project>,
}

impl WriteSet {
    /// Empty write set
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records staged
    pub fn len(&self) -> usize {
        self.requisitions.len()
            + self.deliveries.len()
            + self.status_events.len()
            + self.tags.len()
            + self.institutes.len()
            + self.departments.len()
            + self.profiles.len()
            + self.projects.len()
    }

    /// True if nothing is staged
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Point-in-time view of the ledger used for aggregation
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    /// Requisitions by ID
    pub requisitions: HashMap<Uuid, Requisition>,
    /// All deliveries, ordered by recording time
    pub deliveries: Vec<Delivery>,
    /// Projects by ID
    pub projects: HashMap<Uuid, Project>,
    /// Profiles by ID
    pub profiles: HashMap<Uuid, Profile>,
    /// Institutes by ID
    pub institutes: HashMap<Uuid, Institute>,
    /// Departments by ID
    pub departments: HashMap<Uuid, Department>,
}

/// Deterministic delivery order: recording time, then ID
pub(crate) fn sort_deliveries(deliveries: &mut [Delivery]) {
    deliveries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_level_zero_file_num_compaction_trigger(
            config.rocksdb.level0_file_num_compaction_trigger,
        );

        // Small records, read-mostly: level compaction
        db_opts.set_compaction_style(DBCompactionStyle::Level);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_REQUISITIONS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_DELIVERIES, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_STATUS, Self::cf_options_history()),
            ColumnFamilyDescriptor::new(CF_TAGS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_DIRECTORY, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened fulfillment store");

        Ok(Self { db: Arc::new(db) })
    }

    // Column family options

    fn cf_options_records() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_history() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn get_value<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Values under a key prefix, in key order
    fn scan_prefix<T: DeserializeOwned>(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<T>> {
        let cf = self.cf_handle(cf_name)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut values = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(bincode::deserialize(&value)?);
        }
        Ok(values)
    }

    /// Keys under a prefix in the index family, prefix stripped
    fn index_suffixes(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut suffixes = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            suffixes.push(key[prefix.len()..].to_vec());
        }
        Ok(suffixes)
    }

    fn lookup_index(&self, key: &[u8]) -> Result<Option<Uuid>> {
        let cf = self.cf_handle(CF_INDICES)?;
        match self.db.get_cf(cf, key)? {
            Some(value) => Ok(Some(uuid_from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(
        batch: &mut WriteBatch,
        cf: &ColumnFamily,
        key: &[u8],
        value: &T,
    ) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        batch.put_cf(cf, key, bytes);
        Ok(())
    }

    // Index key helpers

    fn index_key_protocol(protocol: &Protocol) -> Vec<u8> {
        let mut key = vec![IDX_PROTOCOL];
        key.extend_from_slice(protocol.as_str().as_bytes());
        key
    }

    fn index_key_delivery(requisition_id: &Uuid, delivery_id: Option<Uuid>) -> Vec<u8> {
        let mut key = vec![IDX_DELIVERY];
        key.extend_from_slice(requisition_id.as_bytes());
        if let Some(id) = delivery_id {
            key.extend_from_slice(id.as_bytes());
        }
        key
    }

    fn index_key_slug(slug: &str) -> Vec<u8> {
        let mut key = vec![IDX_SLUG];
        key.extend_from_slice(slug.as_bytes());
        key
    }

    fn status_key(requisition_id: &Uuid, sequence: u64) -> Vec<u8> {
        let mut key = requisition_id.as_bytes().to_vec();
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    fn directory_key(kind: u8, id: &Uuid) -> Vec<u8> {
        let mut key = vec![kind];
        key.extend_from_slice(id.as_bytes());
        key
    }
}

impl LedgerStore for Storage {
    fn get_requisition(&self, id: Uuid) -> Result<Requisition> {
        self.get_value(CF_REQUISITIONS, id.as_bytes())?
            .ok_or_else(|| Error::RequisitionNotFound(id.to_string()))
    }

    fn find_requisition(&self, protocol: &Protocol) -> Result<Option<Requisition>> {
        match self.lookup_index(&Self::index_key_protocol(protocol))? {
            Some(id) => self.get_value(CF_REQUISITIONS, id.as_bytes()),
            None => Ok(None),
        }
    }

    fn get_delivery(&self, id: Uuid) -> Result<Delivery> {
        self.get_value(CF_DELIVERIES, id.as_bytes())?
            .ok_or_else(|| Error::DeliveryNotFound(id.to_string()))
    }

    fn requisition_deliveries(&self, requisition_id: Uuid) -> Result<Vec<Delivery>> {
        let prefix = Self::index_key_delivery(&requisition_id, None);

        let mut deliveries = Vec::new();
        for suffix in self.index_suffixes(&prefix)? {
            let delivery_id = uuid_from_slice(&suffix)?;
            deliveries.push(self.get_delivery(delivery_id)?);
        }

        sort_deliveries(&mut deliveries);
        Ok(deliveries)
    }

    fn status_history(&self, requisition_id: Uuid) -> Result<Vec<StatusEvent>> {
        self.scan_prefix(CF_STATUS, requisition_id.as_bytes())
    }

    fn get_tag(&self, name: &str) -> Result<Option<Tag>> {
        self.get_value(CF_TAGS, name.as_bytes())
    }

    fn list_tags(&self) -> Result<Vec<Tag>> {
        self.scan_prefix(CF_TAGS, &[])
    }

    fn get_project(&self, id: Uuid) -> Result<Project> {
        self.get_value(CF_DIRECTORY, &Self::directory_key(KIND_PROJECT, &id))?
            .ok_or_else(|| Error::ProjectNotFound(id.to_string()))
    }

    fn find_project_by_slug(&self, slug: &str) -> Result<Option<Project>> {
        match self.lookup_index(&Self::index_key_slug(slug))? {
            Some(id) => self.get_value(CF_DIRECTORY, &Self::directory_key(KIND_PROJECT, &id)),
            None => Ok(None),
        }
    }

    fn get_profile(&self, id: Uuid) -> Result<Profile> {
        self.get_value(CF_DIRECTORY, &Self::directory_key(KIND_PROFILE, &id))?
            .ok_or_else(|| Error::ProfileNotFound(id.to_string()))
    }

    fn get_institute(&self, id: Uuid) -> Result<Institute> {
        self.get_value(CF_DIRECTORY, &Self::directory_key(KIND_INSTITUTE, &id))?
            .ok_or_else(|| Error::InstituteNotFound(id.to_string()))
    }

    fn get_department(&self, id: Uuid) -> Result<Department> {
        self.get_value(CF_DIRECTORY, &Self::directory_key(KIND_DEPARTMENT, &id))?
            .ok_or_else(|| Error::DepartmentNotFound(id.to_string()))
    }

    fn snapshot(&self) -> Result<LedgerSnapshot> {
        let snapshot = self.db.snapshot();
        let mut view = LedgerSnapshot::default();

        let cf = self.cf_handle(CF_REQUISITIONS)?;
        for item in snapshot.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let requisition: Requisition = bincode::deserialize(&value)?;
            view.requisitions.insert(requisition.id, requisition);
        }

        let cf = self.cf_handle(CF_DELIVERIES)?;
        for item in snapshot.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            view.deliveries.push(bincode::deserialize(&value)?);
        }
        sort_deliveries(&mut view.deliveries);

        let cf = self.cf_handle(CF_DIRECTORY)?;
        for item in snapshot.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            match key.first().copied() {
                Some(KIND_INSTITUTE) => {
                    let institute: Institute = bincode::deserialize(&value)?;
                    view.institutes.insert(institute.id, institute);
                }
                Some(KIND_DEPARTMENT) => {
                    let department: Department = bincode::deserialize(&value)?;
                    view.departments.insert(department.id, department);
                }
                Some(KIND_PROFILE) => {
                    let profile: Profile = bincode::deserialize(&value)?;
                    view.profiles.insert(profile.id, profile);
                }
                Some(KIND_PROJECT) => {
                    let project: Project = bincode::deserialize(&value)?;
                    view.projects.insert(project.id, project);
                }
                other => {
                    tracing::warn!(kind = ?other, "Skipping unknown directory record");
                }
            }
        }

        tracing::debug!(
            requisitions = view.requisitions.len(),
            deliveries = view.deliveries.len(),
            "Snapshot loaded"
        );

        Ok(view)
    }

    fn commit(&self, set: WriteSet) -> Result<()> {
        if set.is_empty() {
            return Ok(());
        }

        let records = set.len();
        let mut batch = WriteBatch::default();

        let cf_requisitions = self.cf_handle(CF_REQUISITIONS)?;
        let cf_deliveries = self.cf_handle(CF_DELIVERIES)?;
        let cf_status = self.cf_handle(CF_STATUS)?;
        let cf_tags = self.cf_handle(CF_TAGS)?;
        let cf_directory = self.cf_handle(CF_DIRECTORY)?;
        let cf_indices = self.cf_handle(CF_INDICES)?;

        for requisition in &set.requisitions {
            Self::put(&mut batch, cf_requisitions, requisition.id.as_bytes(), requisition)?;
            batch.put_cf(
                cf_indices,
                Self::index_key_protocol(&requisition.protocol),
                requisition.id.as_bytes(),
            );
        }

        for delivery in &set.deliveries {
            Self::put(&mut batch, cf_deliveries, delivery.id.as_bytes(), delivery)?;
            batch.put_cf(
                cf_indices,
                Self::index_key_delivery(&delivery.requisition_id, Some(delivery.id)),
                b"",
            );
        }

        for event in &set.status_events {
            let key = Self::status_key(&event.requisition_id, event.sequence);
            Self::put(&mut batch, cf_status, &key, event)?;
        }

        for tag in &set.tags {
            Self::put(&mut batch, cf_tags, tag.name.as_bytes(), tag)?;
        }

        for institute in &set.institutes {
            let key = Self::directory_key(KIND_INSTITUTE, &institute.id);
            Self::put(&mut batch, cf_directory, &key, institute)?;
        }

        for department in &set.departments {
            let key = Self::directory_key(KIND_DEPARTMENT, &department.id);
            Self::put(&mut batch, cf_directory, &key, department)?;
        }

        for profile in &set.profiles {
            let key = Self::directory_key(KIND_PROFILE, &profile.id);
            Self::put(&mut batch, cf_directory, &key, profile)?;
        }

        for project in &set.projects {
            let key = Self::directory_key(KIND_PROJECT, &project.id);
            Self::put(&mut batch, cf_directory, &key, project)?;
            batch.put_cf(
                cf_indices,
                Self::index_key_slug(&project.slug),
                project.id.as_bytes(),
            );
        }

        // Atomic commit
        self.db.write(batch)?;

        tracing::debug!(records, "Write set committed");
        Ok(())
    }
}

fn uuid_from_slice(bytes: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(bytes).map_err(|e| Error::Storage(format!("Corrupt index entry: {}", e)))
}
