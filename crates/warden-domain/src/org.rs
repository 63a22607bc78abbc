//! Organizations: resource owners inside an instance.

use serde::{Deserialize, Serialize};
use warden_eventstore::{
    Aggregate, AggregateFilter, DecodeError, EventFamily, FieldOperation, SearchQuery,
    StoredEvent, UniqueConstraint, WriteModel,
};
use warden_types::InstanceId;

use crate::member::{self, MemberFact, OrgMembers, RemovedMember};
use crate::DomainEvent;

pub const AGGREGATE_TYPE: &str = "org";
pub const UNIQUE_ORG_NAME: &str = "org_names";
const NAME_TAKEN: &str = "Errors.Org.AlreadyExists";

pub const ADDED: &str = "org.added";
pub const REMOVED: &str = "org.removed";
pub const MEMBER_ADDED: &str = "org.member.added";
pub const MEMBER_REMOVED: &str = "org.member.removed";

/// Instances holding at least one organization that was not removed.
pub fn instances_with_orgs() -> SearchQuery {
    SearchQuery::across_instances()
        .filter(
            AggregateFilter::new()
                .aggregate_types([AGGREGATE_TYPE])
                .event_types([ADDED]),
        )
        .exclude_aggregates_with([AGGREGATE_TYPE], [REMOVED])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgAdded {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgRemoved {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrgEvent {
    Added(OrgAdded),
    Removed(OrgRemoved),
    MemberAdded(MemberFact),
    MemberRemoved(RemovedMember),
}

impl EventFamily for OrgEvent {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE;
    const EVENT_TYPES: &'static [&'static str] = &[ADDED, REMOVED, MEMBER_ADDED, MEMBER_REMOVED];

    fn event_type(&self) -> &'static str {
        match self {
            OrgEvent::Added(_) => ADDED,
            OrgEvent::Removed(_) => REMOVED,
            OrgEvent::MemberAdded(_) => MEMBER_ADDED,
            OrgEvent::MemberRemoved(_) => MEMBER_REMOVED,
        }
    }

    fn payload(&self) -> serde_json::Result<Option<serde_json::Value>> {
        match self {
            OrgEvent::Added(p) => serde_json::to_value(p),
            OrgEvent::Removed(p) => serde_json::to_value(p),
            OrgEvent::MemberAdded(p) => serde_json::to_value(p),
            OrgEvent::MemberRemoved(p) => serde_json::to_value(p),
        }
        .map(Some)
    }

    fn decode(event: &StoredEvent) -> Result<Self, DecodeError> {
        match event.event_type.as_str() {
            ADDED => event.unmarshal().map(OrgEvent::Added),
            REMOVED => event.unmarshal().map(OrgEvent::Removed),
            MEMBER_ADDED => event.unmarshal().map(OrgEvent::MemberAdded),
            MEMBER_REMOVED => event.unmarshal().map(OrgEvent::MemberRemoved),
            other => Err(DecodeError::UnknownEventType(other.to_string())),
        }
    }

    fn unique_constraints(&self, aggregate: &Aggregate) -> Vec<UniqueConstraint> {
        match self {
            OrgEvent::Added(p) => vec![UniqueConstraint::add(UNIQUE_ORG_NAME, &p.name, NAME_TAKEN)],
            OrgEvent::Removed(p) => vec![UniqueConstraint::remove(UNIQUE_ORG_NAME, &p.name)],
            OrgEvent::MemberAdded(fact) => vec![member::add_constraint::<OrgMembers>(fact, aggregate)],
            OrgEvent::MemberRemoved(p) => {
                vec![member::remove_constraint::<OrgMembers>(&p.user_id, aggregate)]
            }
        }
    }

    fn field_operations(&self, _aggregate: &Aggregate) -> Vec<FieldOperation> {
        match self {
            OrgEvent::Added(_) => Vec::new(),
            OrgEvent::Removed(_) => vec![FieldOperation::RemoveAggregate],
            OrgEvent::MemberAdded(fact) => member::set_fields::<OrgMembers>(fact),
            OrgEvent::MemberRemoved(p) => member::remove_fields::<OrgMembers>(&p.user_id),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrgState {
    #[default]
    Unspecified,
    Active,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgWriteModel {
    pub instance_id: InstanceId,
    pub org_id: String,
    pub state: OrgState,
    pub name: String,
    pub members: Vec<MemberFact>,
}

impl OrgWriteModel {
    pub fn new(instance_id: impl Into<InstanceId>, org_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            org_id: org_id.into(),
            state: OrgState::Unspecified,
            name: String::new(),
            members: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == OrgState::Active
    }
}

impl WriteModel<DomainEvent> for OrgWriteModel {
    fn query(&self) -> SearchQuery {
        SearchQuery::new(self.instance_id.clone()).filter(
            AggregateFilter::new()
                .aggregate_types([AGGREGATE_TYPE])
                .aggregate_ids([self.org_id.as_str()]),
        )
    }

    fn reduce(&mut self, _event: &StoredEvent, decoded: &DomainEvent) {
        let DomainEvent::Org(event) = decoded else {
            return;
        };
        match event {
            OrgEvent::Added(p) => {
                self.state = OrgState::Active;
                self.name = p.name.clone();
            }
            OrgEvent::Removed(_) => self.state = OrgState::Removed,
            OrgEvent::MemberAdded(fact) => self.members.push(fact.clone()),
            OrgEvent::MemberRemoved(p) => self.members.retain(|m| m.user_id != p.user_id),
        }
    }
}
