//! Membership facts shared by every aggregate that has members.
//!
//! A member event is a [`MemberFact`] held by value inside the concrete
//! event of its aggregate. The aggregate contributes only its metadata
//! through a [`MemberScope`]: unique type, search object type and error
//! messages.

use serde::{Deserialize, Serialize};
use warden_eventstore::{Aggregate, FieldOperation, SearchObject, SearchValue, UniqueConstraint};

/// A user's membership in an aggregate and the roles it grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberFact {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl MemberFact {
    pub fn new<I, S>(user_id: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user_id: user_id.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }
}

/// Payload of a member removal: only the user is needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedMember {
    pub user_id: String,
}

/// Aggregate-specific metadata of a membership relation.
pub trait MemberScope {
    /// Unique type reserving `(aggregate id, user id)`.
    const UNIQUE_TYPE: &'static str;
    /// Search object type of member fields.
    const OBJECT_TYPE: &'static str;
    const ALREADY_EXISTS: &'static str;
}

pub struct ProjectMembers;

impl MemberScope for ProjectMembers {
    const UNIQUE_TYPE: &'static str = "project_members";
    const OBJECT_TYPE: &'static str = "project_member";
    const ALREADY_EXISTS: &'static str = "Errors.Project.Member.AlreadyExists";
}

pub struct OrgMembers;

impl MemberScope for OrgMembers {
    const UNIQUE_TYPE: &'static str = "org_members";
    const OBJECT_TYPE: &'static str = "org_member";
    const ALREADY_EXISTS: &'static str = "Errors.Org.Member.AlreadyExists";
}

fn member_key(aggregate: &Aggregate, user_id: &str) -> String {
    format!("{}:{}", aggregate.id, user_id)
}

pub(crate) fn add_constraint<S: MemberScope>(
    fact: &MemberFact,
    aggregate: &Aggregate,
) -> UniqueConstraint {
    UniqueConstraint::add(
        S::UNIQUE_TYPE,
        member_key(aggregate, &fact.user_id),
        S::ALREADY_EXISTS,
    )
}

pub(crate) fn remove_constraint<S: MemberScope>(
    user_id: &str,
    aggregate: &Aggregate,
) -> UniqueConstraint {
    UniqueConstraint::remove(S::UNIQUE_TYPE, member_key(aggregate, user_id))
}

pub(crate) fn set_fields<S: MemberScope>(fact: &MemberFact) -> Vec<FieldOperation> {
    let object = SearchObject::new(S::OBJECT_TYPE, fact.user_id.clone(), 1);
    vec![
        FieldOperation::set(object.clone(), "user_id", SearchValue::indexed(fact.user_id.clone())),
        FieldOperation::set(object, "roles", SearchValue::stored(fact.roles.clone())),
    ]
}

pub(crate) fn remove_fields<S: MemberScope>(user_id: &str) -> Vec<FieldOperation> {
    vec![FieldOperation::remove_object(S::OBJECT_TYPE, user_id)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_produce_distinct_constraints() {
        let fact = MemberFact::new("u1", ["OWNER"]);
        let project = Aggregate::new("i", "o", "project", "p1");
        let org = Aggregate::new("i", "o", "org", "o");

        let a = add_constraint::<ProjectMembers>(&fact, &project);
        let b = add_constraint::<OrgMembers>(&fact, &org);
        assert_eq!(a.unique_type, "project_members");
        assert_eq!(a.unique_field, "p1:u1");
        assert_eq!(b.unique_type, "org_members");
        assert_eq!(b.error_message, "Errors.Org.Member.AlreadyExists");
        assert_eq!(
            remove_constraint::<ProjectMembers>("u1", &project).unique_field,
            "p1:u1"
        );
    }

    #[test]
    fn roles_default_to_empty() {
        let fact: MemberFact =
            serde_json::from_value(serde_json::json!({ "user_id": "u1" })).expect("decode");
        assert!(fact.roles.is_empty());
    }
}
