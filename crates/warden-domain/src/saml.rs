//! SAML service-provider applications.
//!
//! Entity IDs identify a service provider across every instance, so their
//! unique constraint is global.

use serde::{Deserialize, Serialize};
use warden_eventstore::{
    Aggregate, AggregateFilter, DecodeError, EventFamily, FieldOperation, SearchObject,
    SearchQuery, SearchValue, StoredEvent, UniqueConstraint, WriteModel,
};
use warden_types::InstanceId;

use crate::DomainEvent;

pub const AGGREGATE_TYPE: &str = "saml_app";
pub const UNIQUE_ENTITY_ID: &str = "saml_entity_ids";
const ENTITY_ID_TAKEN: &str = "Errors.Project.App.SAMLEntityIDAlreadyExists";

pub const ADDED: &str = "saml_app.added";
pub const CONFIG_CHANGED: &str = "saml_app.config.changed";
pub const REMOVED: &str = "saml_app.removed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamlAppAdded {
    pub project_id: String,
    pub name: String,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_url: Option<String>,
}

/// Configuration update; `None` means the field is left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamlConfigChanged {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub old_entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamlAppRemoved {
    pub entity_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SamlAppEvent {
    Added(SamlAppAdded),
    ConfigChanged(SamlConfigChanged),
    Removed(SamlAppRemoved),
}

impl EventFamily for SamlAppEvent {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE;
    const EVENT_TYPES: &'static [&'static str] = &[ADDED, CONFIG_CHANGED, REMOVED];

    fn event_type(&self) -> &'static str {
        match self {
            SamlAppEvent::Added(_) => ADDED,
            SamlAppEvent::ConfigChanged(_) => CONFIG_CHANGED,
            SamlAppEvent::Removed(_) => REMOVED,
        }
    }

    fn payload(&self) -> serde_json::Result<Option<serde_json::Value>> {
        match self {
            SamlAppEvent::Added(p) => serde_json::to_value(p),
            SamlAppEvent::ConfigChanged(p) => serde_json::to_value(p),
            SamlAppEvent::Removed(p) => serde_json::to_value(p),
        }
        .map(Some)
    }

    fn decode(event: &StoredEvent) -> Result<Self, DecodeError> {
        match event.event_type.as_str() {
            ADDED => event.unmarshal().map(SamlAppEvent::Added),
            CONFIG_CHANGED => event.unmarshal().map(SamlAppEvent::ConfigChanged),
            REMOVED => event.unmarshal().map(SamlAppEvent::Removed),
            other => Err(DecodeError::UnknownEventType(other.to_string())),
        }
    }

    fn unique_constraints(&self, _aggregate: &Aggregate) -> Vec<UniqueConstraint> {
        match self {
            SamlAppEvent::Added(p) => vec![UniqueConstraint::add_global(
                UNIQUE_ENTITY_ID,
                &p.entity_id,
                ENTITY_ID_TAKEN,
            )],
            SamlAppEvent::ConfigChanged(p) => match &p.entity_id {
                Some(entity_id) => vec![
                    UniqueConstraint::remove_global(UNIQUE_ENTITY_ID, &p.old_entity_id),
                    UniqueConstraint::add_global(UNIQUE_ENTITY_ID, entity_id, ENTITY_ID_TAKEN),
                ],
                None => Vec::new(),
            },
            SamlAppEvent::Removed(p) => {
                vec![UniqueConstraint::remove_global(UNIQUE_ENTITY_ID, &p.entity_id)]
            }
        }
    }

    fn field_operations(&self, aggregate: &Aggregate) -> Vec<FieldOperation> {
        let object = || SearchObject::new(AGGREGATE_TYPE, aggregate.id.clone(), 1);
        match self {
            SamlAppEvent::Added(p) => vec![
                FieldOperation::set(object(), "entity_id", SearchValue::indexed(p.entity_id.clone())),
                FieldOperation::set(object(), "project_id", SearchValue::indexed(p.project_id.clone())),
            ],
            SamlAppEvent::ConfigChanged(p) => p
                .entity_id
                .iter()
                .map(|id| FieldOperation::set(object(), "entity_id", SearchValue::indexed(id.clone())))
                .collect(),
            SamlAppEvent::Removed(_) => vec![FieldOperation::RemoveAggregate],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamlAppWriteModel {
    pub instance_id: InstanceId,
    pub app_id: String,
    pub exists: bool,
    pub project_id: String,
    pub entity_id: String,
    pub metadata_url: Option<String>,
}

impl SamlAppWriteModel {
    pub fn new(instance_id: impl Into<InstanceId>, app_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            app_id: app_id.into(),
            exists: false,
            project_id: String::new(),
            entity_id: String::new(),
            metadata_url: None,
        }
    }
}

impl WriteModel<DomainEvent> for SamlAppWriteModel {
    fn query(&self) -> SearchQuery {
        SearchQuery::new(self.instance_id.clone()).filter(
            AggregateFilter::new()
                .aggregate_types([AGGREGATE_TYPE])
                .aggregate_ids([self.app_id.as_str()]),
        )
    }

    fn reduce(&mut self, _event: &StoredEvent, decoded: &DomainEvent) {
        let DomainEvent::SamlApp(event) = decoded else {
            return;
        };
        match event {
            SamlAppEvent::Added(p) => {
                self.exists = true;
                self.project_id = p.project_id.clone();
                self.entity_id = p.entity_id.clone();
                self.metadata_url = p.metadata_url.clone();
            }
            SamlAppEvent::ConfigChanged(p) => {
                if let Some(entity_id) = &p.entity_id {
                    self.entity_id = entity_id.clone();
                }
                if p.metadata_url.is_some() {
                    self.metadata_url = p.metadata_url.clone();
                }
            }
            SamlAppEvent::Removed(_) => self.exists = false,
        }
    }
}
