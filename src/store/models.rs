use std::collections::HashMap;
use std::str::FromStr;

use chrono::{NaiveDateTime, TimeZone, Utc};
use diesel::prelude::*;
use serde_json::Value;

use crate::wire::{Capability, WorkerDescriptor, WorkerStatus};

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug)]
#[diesel(table_name = crate::store::schema::workers)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct WorkerRow {
    pub id: String,
    pub worker_type: String,
    pub status: String,
    pub metadata: String,
    pub registered_at: NaiveDateTime,
    pub last_seen: NaiveDateTime,
}

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = crate::store::schema::capabilities)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CapabilityRow {
    pub id: i32,
    pub worker_id: String,
    pub name: String,
    pub description: String,
    pub input_schema: String,
    pub output_schema: String,
    pub http_method: String,
    pub accepts_file: bool,
    pub file_field_name: Option<String>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::store::schema::capabilities)]
pub struct NewCapabilityRow {
    pub worker_id: String,
    pub name: String,
    pub description: String,
    pub input_schema: String,
    pub output_schema: String,
    pub http_method: String,
    pub accepts_file: bool,
    pub file_field_name: Option<String>,
}

impl WorkerRow {
    pub fn from_descriptor(desc: &WorkerDescriptor) -> Self {
        Self {
            id: desc.id.clone(),
            worker_type: desc.worker_type.clone(),
            status: desc.status.to_string(),
            metadata: serde_json::to_string(&desc.metadata)
                .unwrap_or_else(|_| "{}".into()),
            registered_at: desc.registered_at.naive_utc(),
            last_seen: desc.last_seen.naive_utc(),
        }
    }

    pub fn into_descriptor(
        self,
        capabilities: Vec<CapabilityRow>,
    ) -> WorkerDescriptor {
        WorkerDescriptor {
            worker_type: self.worker_type,
            status: WorkerStatus::from_str(&self.status)
                .unwrap_or(WorkerStatus::Offline),
            capabilities: capabilities
                .into_iter()
                .map(CapabilityRow::into_capability)
                .collect(),
            metadata: serde_json::from_str::<HashMap<String, String>>(
                &self.metadata,
            )
            .unwrap_or_default(),
            registered_at: Utc.from_utc_datetime(&self.registered_at),
            last_seen: Utc.from_utc_datetime(&self.last_seen),
            id: self.id,
        }
    }
}

impl NewCapabilityRow {
    pub fn from_capability(worker_id: &str, cap: &Capability) -> Self {
        Self {
            worker_id: worker_id.into(),
            name: cap.name.clone(),
            description: cap.description.clone(),
            input_schema: cap.input_schema.to_string(),
            output_schema: cap.output_schema.to_string(),
            http_method: cap.http_method.clone(),
            accepts_file: cap.accepts_file,
            file_field_name: cap.file_field_name.clone(),
        }
    }
}

impl CapabilityRow {
    pub fn into_capability(self) -> Capability {
        Capability {
            name: self.name,
            description: self.description,
            input_schema: serde_json::from_str(&self.input_schema)
                .unwrap_or(Value::Null),
            output_schema: serde_json::from_str(&self.output_schema)
                .unwrap_or(Value::Null),
            http_method: self.http_method,
            accepts_file: self.accepts_file,
            file_field_name: self.file_field_name,
        }
    }
}
