//! Unique-constraint directives and the ledger they maintain.
//!
//! Directives ride on commands and are applied inside the push transaction,
//! after the events are inserted and before commit. A colliding add aborts
//! the push; nothing of it survives.

use std::collections::HashSet;

use rusqlite::{params, Transaction};
use warden_types::{Error, InstanceId, Result};

use crate::error::{is_constraint_violation, storage_error};

/// Scope marker stored as `instance_id` for constraints shared by all tenants.
pub(crate) const GLOBAL_SCOPE: &str = "";

/// What a directive does to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueAction {
    /// Reserve the key within the pushing instance.
    AddInstance,
    /// Reserve the key across every instance.
    AddGlobal,
    /// Release an instance-scoped key.
    RemoveInstance,
    /// Release a global key.
    RemoveGlobal,
    /// Release every instance-scoped key of the pushing instance.
    RemoveAllOfInstance,
}

impl UniqueAction {
    fn is_add(self) -> bool {
        matches!(self, Self::AddInstance | Self::AddGlobal)
    }

    fn is_global(self) -> bool {
        matches!(self, Self::AddGlobal | Self::RemoveGlobal)
    }
}

/// A directive attached to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueConstraint {
    pub unique_type: String,
    pub unique_field: String,
    /// Message reported with `AlreadyExists` when an add collides.
    pub error_message: String,
    pub action: UniqueAction,
}

impl UniqueConstraint {
    pub fn add(
        unique_type: impl Into<String>,
        unique_field: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            unique_type: unique_type.into(),
            unique_field: unique_field.into(),
            error_message: error_message.into(),
            action: UniqueAction::AddInstance,
        }
    }

    pub fn add_global(
        unique_type: impl Into<String>,
        unique_field: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            action: UniqueAction::AddGlobal,
            ..Self::add(unique_type, unique_field, error_message)
        }
    }

    pub fn remove(unique_type: impl Into<String>, unique_field: impl Into<String>) -> Self {
        Self {
            unique_type: unique_type.into(),
            unique_field: unique_field.into(),
            error_message: String::new(),
            action: UniqueAction::RemoveInstance,
        }
    }

    pub fn remove_global(unique_type: impl Into<String>, unique_field: impl Into<String>) -> Self {
        Self {
            action: UniqueAction::RemoveGlobal,
            ..Self::remove(unique_type, unique_field)
        }
    }

    /// Releases every instance-scoped key of the instance. Used when the
    /// instance itself is removed.
    pub fn remove_instance_constraints() -> Self {
        Self {
            unique_type: String::new(),
            unique_field: String::new(),
            error_message: String::new(),
            action: UniqueAction::RemoveAllOfInstance,
        }
    }

    fn scope<'a>(&self, instance: &'a InstanceId) -> &'a str {
        if self.action.is_global() {
            GLOBAL_SCOPE
        } else {
            instance.as_str()
        }
    }

    fn collision(&self) -> Error {
        let message = if self.error_message.is_empty() {
            format!("{} {} already exists", self.unique_type, self.unique_field)
        } else {
            self.error_message.clone()
        };
        Error::already_exists(message)
    }
}

/// `(scope, type, field)` of a ledger row.
type LedgerKey<'a> = (String, &'a str, String);

/// The ledger as the directives checked so far would leave it.
#[derive(Default)]
struct Pending<'a> {
    reserved: HashSet<LedgerKey<'a>>,
    released: HashSet<LedgerKey<'a>>,
    instance_wiped: bool,
}

impl<'a> Pending<'a> {
    fn present(&self, tx: &Transaction<'_>, key: &LedgerKey<'a>) -> Result<bool> {
        if self.reserved.contains(key) {
            return Ok(true);
        }
        if self.released.contains(key) || (self.instance_wiped && key.0 != GLOBAL_SCOPE) {
            return Ok(false);
        }
        exists(tx, key)
    }

    fn release(&mut self, key: LedgerKey<'a>) {
        self.reserved.remove(&key);
        self.released.insert(key);
    }
}

/// Verifies that no add in `directives` collides with the ledger as it
/// would look after the earlier directives ran.
///
/// Removals follow the same lower-case fallback as [`apply`]. Runs inside
/// the push transaction, so the answer holds until commit.
pub(crate) fn check(
    tx: &Transaction<'_>,
    instance: &InstanceId,
    directives: &[&UniqueConstraint],
) -> Result<()> {
    let mut pending = Pending::default();

    for directive in directives {
        let key = (
            directive.scope(instance).to_string(),
            directive.unique_type.as_str(),
            directive.unique_field.clone(),
        );
        match directive.action {
            UniqueAction::RemoveAllOfInstance => {
                pending.instance_wiped = true;
                pending.reserved.retain(|(s, _, _)| s.as_str() == GLOBAL_SCOPE);
            }
            UniqueAction::RemoveInstance | UniqueAction::RemoveGlobal => {
                if !pending.present(tx, &key)? {
                    // SQLite's LOWER() only folds ASCII.
                    let lower = (key.0.clone(), key.1, key.2.to_ascii_lowercase());
                    pending.release(lower);
                }
                pending.release(key);
            }
            UniqueAction::AddInstance | UniqueAction::AddGlobal => {
                if pending.present(tx, &key)? {
                    return Err(directive.collision());
                }
                pending.reserved.insert(key);
            }
        }
    }
    Ok(())
}

fn exists(tx: &Transaction<'_>, key: &LedgerKey<'_>) -> Result<bool> {
    tx.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM unique_constraints
            WHERE instance_id = ?1 AND unique_type = ?2 AND unique_field = ?3
         )",
        params![key.0, key.1, key.2],
        |row| row.get(0),
    )
    .map_err(storage_error)
}

/// Applies the directives in declaration order.
///
/// An add that hits an existing row reports `AlreadyExists` with the
/// directive's message. Removing a missing key is not an error; when the
/// exact key is absent its lower-cased form is removed instead.
pub(crate) fn apply(
    tx: &Transaction<'_>,
    instance: &InstanceId,
    directives: &[&UniqueConstraint],
) -> Result<()> {
    for directive in directives {
        let scope = directive.scope(instance);
        match directive.action {
            UniqueAction::AddInstance | UniqueAction::AddGlobal => {
                let inserted = tx.execute(
                    "INSERT INTO unique_constraints
                        (instance_id, unique_type, unique_field, error_message)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        scope,
                        directive.unique_type,
                        directive.unique_field,
                        directive.error_message
                    ],
                );
                match inserted {
                    Ok(_) => {}
                    Err(e) if is_constraint_violation(&e) => return Err(directive.collision()),
                    Err(e) => return Err(storage_error(e)),
                }
            }
            UniqueAction::RemoveInstance | UniqueAction::RemoveGlobal => {
                let removed = tx
                    .execute(
                        "DELETE FROM unique_constraints
                         WHERE instance_id = ?1 AND unique_type = ?2 AND unique_field = ?3",
                        params![scope, directive.unique_type, directive.unique_field],
                    )
                    .map_err(storage_error)?;
                if removed == 0 {
                    tx.execute(
                        "DELETE FROM unique_constraints
                         WHERE instance_id = ?1 AND unique_type = ?2 AND unique_field = LOWER(?3)",
                        params![scope, directive.unique_type, directive.unique_field],
                    )
                    .map_err(storage_error)?;
                }
            }
            UniqueAction::RemoveAllOfInstance => {
                tx.execute(
                    "DELETE FROM unique_constraints WHERE instance_id = ?1",
                    params![instance.as_str()],
                )
                .map_err(storage_error)?;
            }
        }
        tracing::trace!(
            instance_id = %instance,
            unique_type = %directive.unique_type,
            add = directive.action.is_add(),
            global = directive.action.is_global(),
            "applied unique constraint"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use warden_types::ErrorKind;

    fn ledger() -> Connection {
        let mut conn = Connection::open_in_memory().expect("should open in-memory db");
        warden_db::run_migrations(&mut conn).expect("migrations should succeed");
        conn
    }

    fn count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM unique_constraints", [], |r| r.get(0))
            .expect("should count rows")
    }

    #[test]
    fn add_then_duplicate_add_collides() {
        let mut conn = ledger();
        let inst = InstanceId::new("i1");
        let add = UniqueConstraint::add("project_names", "X:O1", "Errors.Project.AlreadyExists");

        let tx = conn.transaction().expect("tx");
        apply(&tx, &inst, &[&add]).expect("first add should succeed");
        tx.commit().expect("commit");

        let tx = conn.transaction().expect("tx");
        let err = check(&tx, &inst, &[&add]).expect_err("duplicate should be detected");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(err.message(), "Errors.Project.AlreadyExists");
        let err = apply(&tx, &inst, &[&add]).expect_err("duplicate insert should fail");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn instance_scope_does_not_leak() {
        let mut conn = ledger();
        let add = UniqueConstraint::add("usernames", "ada", "taken");
        let tx = conn.transaction().expect("tx");
        apply(&tx, &InstanceId::new("a"), &[&add]).expect("add in a");
        check(&tx, &InstanceId::new("b"), &[&add]).expect("b is a different scope");
        apply(&tx, &InstanceId::new("b"), &[&add]).expect("add in b");
        tx.commit().expect("commit");
        assert_eq!(count(&conn), 2);
    }

    #[test]
    fn global_scope_spans_instances() {
        let mut conn = ledger();
        let add = UniqueConstraint::add_global("entity_ids", "https://sp.example", "taken");
        let tx = conn.transaction().expect("tx");
        apply(&tx, &InstanceId::new("a"), &[&add]).expect("first global add");
        let err = check(&tx, &InstanceId::new("b"), &[&add]).expect_err("global collision");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn remove_then_add_in_one_batch() {
        let mut conn = ledger();
        let inst = InstanceId::new("i1");
        let add = UniqueConstraint::add("names", "K", "taken");
        let remove = UniqueConstraint::remove("names", "K");

        let tx = conn.transaction().expect("tx");
        apply(&tx, &inst, &[&add]).expect("seed");
        check(&tx, &inst, &[&remove, &add]).expect("remove then add is legal");
        apply(&tx, &inst, &[&remove, &add]).expect("remove then add applies");
        tx.commit().expect("commit");
        assert_eq!(count(&conn), 1);
    }

    #[test]
    fn duplicate_add_within_batch_collides() {
        let mut conn = ledger();
        let inst = InstanceId::new("i1");
        let add = UniqueConstraint::add("names", "K", "taken");
        let tx = conn.transaction().expect("tx");
        let err = check(&tx, &inst, &[&add, &add]).expect_err("second add collides");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn removing_missing_key_is_not_an_error() {
        let mut conn = ledger();
        let tx = conn.transaction().expect("tx");
        apply(
            &tx,
            &InstanceId::new("i1"),
            &[&UniqueConstraint::remove("names", "ghost")],
        )
        .expect("missing key removal is a no-op");
    }

    #[test]
    fn removal_falls_back_to_lower_case_key() {
        let mut conn = ledger();
        let inst = InstanceId::new("i1");
        let tx = conn.transaction().expect("tx");
        apply(&tx, &inst, &[&UniqueConstraint::add("emails", "ada@example.com", "taken")])
            .expect("seed");
        apply(&tx, &inst, &[&UniqueConstraint::remove("emails", "Ada@Example.com")])
            .expect("case-tolerant removal");
        tx.commit().expect("commit");
        assert_eq!(count(&conn), 0);
    }

    #[test]
    fn case_tolerant_remove_then_add_in_one_batch() {
        let mut conn = ledger();
        let inst = InstanceId::new("i1");
        let remove = UniqueConstraint::remove("emails", "Ada@Example.com");
        let add = UniqueConstraint::add("emails", "ada@example.com", "taken");

        let tx = conn.transaction().expect("tx");
        apply(&tx, &inst, &[&UniqueConstraint::add("emails", "ada@example.com", "taken")])
            .expect("seed");
        check(&tx, &inst, &[&remove, &add]).expect("lower-cased key is released first");
        apply(&tx, &inst, &[&remove, &add]).expect("remove then add applies");
        tx.commit().expect("commit");
        assert_eq!(count(&conn), 1);
    }

    #[test]
    fn exact_key_removal_does_not_release_lower_case_key() {
        let mut conn = ledger();
        let inst = InstanceId::new("i1");
        let tx = conn.transaction().expect("tx");
        apply(
            &tx,
            &inst,
            &[
                &UniqueConstraint::add("emails", "Ada@Example.com", "taken"),
                &UniqueConstraint::add("emails", "ada@example.com", "taken"),
            ],
        )
        .expect("seed both spellings");

        let remove = UniqueConstraint::remove("emails", "Ada@Example.com");
        let add = UniqueConstraint::add("emails", "ada@example.com", "taken");
        let err = check(&tx, &inst, &[&remove, &add]).expect_err("lower-cased key still held");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        let err = apply(&tx, &inst, &[&remove, &add]).expect_err("insert collides too");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn remove_instance_constraints_keeps_globals_and_other_tenants() {
        let mut conn = ledger();
        let a = InstanceId::new("a");
        let b = InstanceId::new("b");
        let tx = conn.transaction().expect("tx");
        apply(&tx, &a, &[&UniqueConstraint::add("names", "1", "taken")]).expect("a");
        apply(&tx, &a, &[&UniqueConstraint::add_global("ids", "g", "taken")]).expect("global");
        apply(&tx, &b, &[&UniqueConstraint::add("names", "1", "taken")]).expect("b");

        let wipe = UniqueConstraint::remove_instance_constraints();
        let re_add = UniqueConstraint::add("names", "1", "taken");
        check(&tx, &a, &[&wipe, &re_add]).expect("wiped keys are free again");
        apply(&tx, &a, &[&wipe]).expect("wipe");
        tx.commit().expect("commit");
        assert_eq!(count(&conn), 2);
    }
}
