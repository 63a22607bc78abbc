//! Projects and their members.

use serde::{Deserialize, Serialize};
use warden_eventstore::{
    Aggregate, AggregateFilter, DecodeError, EventFamily, FieldOperation, SearchObject,
    SearchQuery, SearchValue, StoredEvent, UniqueConstraint, WriteModel,
};
use warden_types::InstanceId;

use crate::member::{self, MemberFact, ProjectMembers, RemovedMember};
use crate::DomainEvent;

pub const AGGREGATE_TYPE: &str = "project";
pub const UNIQUE_PROJECT_NAME: &str = "project_names";
const NAME_TAKEN: &str = "Errors.Project.AlreadyExists";

pub const ADDED: &str = "project.added";
pub const CHANGED: &str = "project.changed";
pub const REMOVED: &str = "project.removed";
pub const MEMBER_ADDED: &str = "project.member.added";
pub const MEMBER_CHANGED: &str = "project.member.changed";
pub const MEMBER_REMOVED: &str = "project.member.removed";

/// Names are unique per organization.
pub fn name_key(name: &str, resource_owner: &str) -> String {
    format!("{name}:{resource_owner}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectAdded {
    pub name: String,
    #[serde(default)]
    pub role_assertion: bool,
}

/// Project update; `None` means the field is left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectChanged {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Name before the change, needed to release its unique key.
    #[serde(default)]
    pub old_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_assertion: Option<bool>,
}

impl ProjectChanged {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.role_assertion.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRemoved {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectEvent {
    Added(ProjectAdded),
    Changed(ProjectChanged),
    Removed(ProjectRemoved),
    MemberAdded(MemberFact),
    MemberChanged(MemberFact),
    MemberRemoved(RemovedMember),
}

impl EventFamily for ProjectEvent {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE;
    const EVENT_TYPES: &'static [&'static str] = &[
        ADDED,
        CHANGED,
        REMOVED,
        MEMBER_ADDED,
        MEMBER_CHANGED,
        MEMBER_REMOVED,
    ];

    fn event_type(&self) -> &'static str {
        match self {
            ProjectEvent::Added(_) => ADDED,
            ProjectEvent::Changed(_) => CHANGED,
            ProjectEvent::Removed(_) => REMOVED,
            ProjectEvent::MemberAdded(_) => MEMBER_ADDED,
            ProjectEvent::MemberChanged(_) => MEMBER_CHANGED,
            ProjectEvent::MemberRemoved(_) => MEMBER_REMOVED,
        }
    }

    fn payload(&self) -> serde_json::Result<Option<serde_json::Value>> {
        match self {
            ProjectEvent::Added(p) => serde_json::to_value(p),
            ProjectEvent::Changed(p) => serde_json::to_value(p),
            ProjectEvent::Removed(p) => serde_json::to_value(p),
            ProjectEvent::MemberAdded(p) | ProjectEvent::MemberChanged(p) => {
                serde_json::to_value(p)
            }
            ProjectEvent::MemberRemoved(p) => serde_json::to_value(p),
        }
        .map(Some)
    }

    fn decode(event: &StoredEvent) -> Result<Self, DecodeError> {
        match event.event_type.as_str() {
            ADDED => event.unmarshal().map(ProjectEvent::Added),
            CHANGED => event.unmarshal().map(ProjectEvent::Changed),
            REMOVED => event.unmarshal().map(ProjectEvent::Removed),
            MEMBER_ADDED => event.unmarshal().map(ProjectEvent::MemberAdded),
            MEMBER_CHANGED => event.unmarshal().map(ProjectEvent::MemberChanged),
            MEMBER_REMOVED => event.unmarshal().map(ProjectEvent::MemberRemoved),
            other => Err(DecodeError::UnknownEventType(other.to_string())),
        }
    }

    fn unique_constraints(&self, aggregate: &Aggregate) -> Vec<UniqueConstraint> {
        let owner = aggregate.resource_owner.as_str();
        match self {
            ProjectEvent::Added(p) => vec![UniqueConstraint::add(
                UNIQUE_PROJECT_NAME,
                name_key(&p.name, owner),
                NAME_TAKEN,
            )],
            ProjectEvent::Changed(p) => match &p.name {
                Some(name) => vec![
                    UniqueConstraint::remove(UNIQUE_PROJECT_NAME, name_key(&p.old_name, owner)),
                    UniqueConstraint::add(UNIQUE_PROJECT_NAME, name_key(name, owner), NAME_TAKEN),
                ],
                None => Vec::new(),
            },
            ProjectEvent::Removed(p) => vec![UniqueConstraint::remove(
                UNIQUE_PROJECT_NAME,
                name_key(&p.name, owner),
            )],
            ProjectEvent::MemberAdded(fact) => {
                vec![member::add_constraint::<ProjectMembers>(fact, aggregate)]
            }
            ProjectEvent::MemberChanged(_) => Vec::new(),
            ProjectEvent::MemberRemoved(p) => {
                vec![member::remove_constraint::<ProjectMembers>(&p.user_id, aggregate)]
            }
        }
    }

    fn field_operations(&self, aggregate: &Aggregate) -> Vec<FieldOperation> {
        let object = || SearchObject::new(AGGREGATE_TYPE, aggregate.id.clone(), 1);
        match self {
            ProjectEvent::Added(p) => vec![FieldOperation::set(
                object(),
                "name",
                SearchValue::indexed(p.name.clone()),
            )],
            ProjectEvent::Changed(p) => p
                .name
                .iter()
                .map(|name| FieldOperation::set(object(), "name", SearchValue::indexed(name.clone())))
                .collect(),
            ProjectEvent::Removed(_) => vec![FieldOperation::RemoveAggregate],
            ProjectEvent::MemberAdded(fact) | ProjectEvent::MemberChanged(fact) => {
                member::set_fields::<ProjectMembers>(fact)
            }
            ProjectEvent::MemberRemoved(p) => member::remove_fields::<ProjectMembers>(&p.user_id),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProjectState {
    #[default]
    Unspecified,
    Active,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectWriteModel {
    pub instance_id: InstanceId,
    pub project_id: String,
    pub state: ProjectState,
    pub name: String,
    pub role_assertion: bool,
    pub members: Vec<MemberFact>,
}

impl ProjectWriteModel {
    pub fn new(instance_id: impl Into<InstanceId>, project_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            project_id: project_id.into(),
            state: ProjectState::Unspecified,
            name: String::new(),
            role_assertion: false,
            members: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ProjectState::Active
    }

    pub fn member(&self, user_id: &str) -> Option<&MemberFact> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    /// Keeps only the fields of `change` that differ from the current state
    /// and fills in the name being replaced.
    pub fn diff(&self, change: &ProjectChanged) -> ProjectChanged {
        ProjectChanged {
            name: change.name.clone().filter(|n| *n != self.name),
            old_name: self.name.clone(),
            role_assertion: change.role_assertion.filter(|r| *r != self.role_assertion),
        }
    }
}

impl WriteModel<DomainEvent> for ProjectWriteModel {
    fn query(&self) -> SearchQuery {
        SearchQuery::new(self.instance_id.clone()).filter(
            AggregateFilter::new()
                .aggregate_types([AGGREGATE_TYPE])
                .aggregate_ids([self.project_id.as_str()]),
        )
    }

    fn reduce(&mut self, _event: &StoredEvent, decoded: &DomainEvent) {
        let DomainEvent::Project(event) = decoded else {
            return;
        };
        match event {
            ProjectEvent::Added(p) => {
                self.state = ProjectState::Active;
                self.name = p.name.clone();
                self.role_assertion = p.role_assertion;
            }
            ProjectEvent::Changed(p) => {
                if let Some(name) = &p.name {
                    self.name = name.clone();
                }
                if let Some(role_assertion) = p.role_assertion {
                    self.role_assertion = role_assertion;
                }
            }
            ProjectEvent::Removed(_) => self.state = ProjectState::Removed,
            ProjectEvent::MemberAdded(fact) => self.members.push(fact.clone()),
            ProjectEvent::MemberChanged(fact) => {
                if let Some(member) = self.members.iter_mut().find(|m| m.user_id == fact.user_id) {
                    member.roles = fact.roles.clone();
                }
            }
            ProjectEvent::MemberRemoved(p) => self.members.retain(|m| m.user_id != p.user_id),
        }
    }
}
