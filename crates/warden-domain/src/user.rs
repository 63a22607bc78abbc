//! Human users.

use serde::{Deserialize, Serialize};
use warden_eventstore::{
    Aggregate, AggregateFilter, DecodeError, EventFamily, FieldOperation, SearchObject,
    SearchQuery, SearchValue, StoredEvent, UniqueConstraint, WriteModel,
};
use warden_types::InstanceId;

use crate::DomainEvent;

pub const AGGREGATE_TYPE: &str = "user";
pub const UNIQUE_USERNAME: &str = "usernames";
const USERNAME_TAKEN: &str = "Errors.User.AlreadyExists";

pub const HUMAN_ADDED: &str = "user.human.added";
pub const USERNAME_CHANGED: &str = "user.username.changed";
pub const PROFILE_CHANGED: &str = "user.human.profile.changed";
pub const REMOVED: &str = "user.removed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanAdded {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameChanged {
    pub username: String,
    pub old_username: String,
}

/// Profile update; `None` means the field is left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileChanged {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nick_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_language: Option<String>,
}

impl ProfileChanged {
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none()
            && self.last_name.is_none()
            && self.nick_name.is_none()
            && self.preferred_language.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRemoved {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserEvent {
    HumanAdded(HumanAdded),
    UsernameChanged(UsernameChanged),
    ProfileChanged(ProfileChanged),
    Removed(UserRemoved),
}

impl EventFamily for UserEvent {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE;
    const EVENT_TYPES: &'static [&'static str] =
        &[HUMAN_ADDED, USERNAME_CHANGED, PROFILE_CHANGED, REMOVED];

    fn event_type(&self) -> &'static str {
        match self {
            UserEvent::HumanAdded(_) => HUMAN_ADDED,
            UserEvent::UsernameChanged(_) => USERNAME_CHANGED,
            UserEvent::ProfileChanged(_) => PROFILE_CHANGED,
            UserEvent::Removed(_) => REMOVED,
        }
    }

    fn payload(&self) -> serde_json::Result<Option<serde_json::Value>> {
        match self {
            UserEvent::HumanAdded(p) => serde_json::to_value(p),
            UserEvent::UsernameChanged(p) => serde_json::to_value(p),
            UserEvent::ProfileChanged(p) => serde_json::to_value(p),
            UserEvent::Removed(p) => serde_json::to_value(p),
        }
        .map(Some)
    }

    fn decode(event: &StoredEvent) -> Result<Self, DecodeError> {
        match event.event_type.as_str() {
            HUMAN_ADDED => event.unmarshal().map(UserEvent::HumanAdded),
            USERNAME_CHANGED => event.unmarshal().map(UserEvent::UsernameChanged),
            PROFILE_CHANGED => event.unmarshal().map(UserEvent::ProfileChanged),
            REMOVED => event.unmarshal().map(UserEvent::Removed),
            other => Err(DecodeError::UnknownEventType(other.to_string())),
        }
    }

    fn unique_constraints(&self, _aggregate: &Aggregate) -> Vec<UniqueConstraint> {
        match self {
            UserEvent::HumanAdded(p) => vec![UniqueConstraint::add(
                UNIQUE_USERNAME,
                &p.username,
                USERNAME_TAKEN,
            )],
            UserEvent::UsernameChanged(p) => vec![
                UniqueConstraint::remove(UNIQUE_USERNAME, &p.old_username),
                UniqueConstraint::add(UNIQUE_USERNAME, &p.username, USERNAME_TAKEN),
            ],
            UserEvent::ProfileChanged(_) => Vec::new(),
            UserEvent::Removed(p) => vec![UniqueConstraint::remove(UNIQUE_USERNAME, &p.username)],
        }
    }

    fn field_operations(&self, aggregate: &Aggregate) -> Vec<FieldOperation> {
        let object = || SearchObject::new(AGGREGATE_TYPE, aggregate.id.clone(), 1);
        match self {
            UserEvent::HumanAdded(p) => vec![
                FieldOperation::set(object(), "username", SearchValue::indexed(p.username.clone())),
                FieldOperation::set(object(), "email", SearchValue::indexed(p.email.clone())),
            ],
            UserEvent::UsernameChanged(p) => vec![FieldOperation::set(
                object(),
                "username",
                SearchValue::indexed(p.username.clone()),
            )],
            UserEvent::ProfileChanged(_) => Vec::new(),
            UserEvent::Removed(_) => vec![FieldOperation::RemoveAggregate],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UserState {
    #[default]
    Unspecified,
    Active,
    Removed,
}

/// Current state of one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserWriteModel {
    pub instance_id: InstanceId,
    pub user_id: String,
    pub state: UserState,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub nick_name: String,
    pub email: String,
    pub preferred_language: Option<String>,
}

impl UserWriteModel {
    pub fn new(instance_id: impl Into<InstanceId>, user_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            user_id: user_id.into(),
            state: UserState::Unspecified,
            username: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            nick_name: String::new(),
            email: String::new(),
            preferred_language: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == UserState::Active
    }

    /// Keeps only the fields of `change` that differ from the current
    /// profile.
    pub fn profile_diff(&self, change: &ProfileChanged) -> ProfileChanged {
        fn differs(new: &Option<String>, current: &str) -> Option<String> {
            new.as_ref().filter(|v| v.as_str() != current).cloned()
        }
        ProfileChanged {
            first_name: differs(&change.first_name, &self.first_name),
            last_name: differs(&change.last_name, &self.last_name),
            nick_name: differs(&change.nick_name, &self.nick_name),
            preferred_language: change
                .preferred_language
                .as_ref()
                .filter(|v| self.preferred_language.as_ref() != Some(*v))
                .cloned(),
        }
    }
}

impl WriteModel<DomainEvent> for UserWriteModel {
    fn query(&self) -> SearchQuery {
        SearchQuery::new(self.instance_id.clone()).filter(
            AggregateFilter::new()
                .aggregate_types([AGGREGATE_TYPE])
                .aggregate_ids([self.user_id.as_str()]),
        )
    }

    fn reduce(&mut self, _event: &StoredEvent, decoded: &DomainEvent) {
        let DomainEvent::User(event) = decoded else {
            return;
        };
        match event {
            UserEvent::HumanAdded(p) => {
                self.state = UserState::Active;
                self.username = p.username.clone();
                self.first_name = p.first_name.clone();
                self.last_name = p.last_name.clone();
                self.email = p.email.clone();
                self.preferred_language = p.preferred_language.clone();
            }
            UserEvent::UsernameChanged(p) => self.username = p.username.clone(),
            UserEvent::ProfileChanged(p) => {
                if let Some(v) = &p.first_name {
                    self.first_name = v.clone();
                }
                if let Some(v) = &p.last_name {
                    self.last_name = v.clone();
                }
                if let Some(v) = &p.nick_name {
                    self.nick_name = v.clone();
                }
                if let Some(v) = &p.preferred_language {
                    self.preferred_language = Some(v.clone());
                }
            }
            UserEvent::Removed(_) => self.state = UserState::Removed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_profile_change_serializes_to_empty_object() {
        let change = ProfileChanged::default();
        assert!(change.is_empty());
        assert_eq!(
            serde_json::to_value(&change).expect("serialize"),
            serde_json::json!({})
        );
    }

    #[test]
    fn username_change_swaps_constraints() {
        let event = UserEvent::UsernameChanged(UsernameChanged {
            username: "new".into(),
            old_username: "old".into(),
        });
        let constraints = event.unique_constraints(&Aggregate::new("i", "o", AGGREGATE_TYPE, "u1"));
        assert_eq!(constraints.len(), 2);
        assert_eq!(constraints[0], UniqueConstraint::remove(UNIQUE_USERNAME, "old"));
        assert_eq!(constraints[1].unique_field, "new");
    }

    #[test]
    fn profile_diff_drops_unchanged_fields() {
        let mut model = UserWriteModel::new("i", "u1");
        model.first_name = "Ada".into();
        model.last_name = "Lovelace".into();
        let diff = model.profile_diff(&ProfileChanged {
            first_name: Some("Ada".into()),
            last_name: Some("King".into()),
            ..ProfileChanged::default()
        });
        assert_eq!(diff.first_name, None);
        assert_eq!(diff.last_name.as_deref(), Some("King"));
    }
}
