//! Command and write-model behaviour against a file-backed store.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use warden_db::{create_pool, run_migrations, DbRuntimeSettings};
use warden_eventstore::{
    Clock, Command, Deadline, Eventstore, EventstoreConfig, Expected, ManualClock, PushIntent,
};
use warden_types::{ErrorKind, InstanceId};

use crate::keypair::{ActiveKeysWriteModel, KeyPairAdded, KeyUsage, SealedKey};
use crate::member::MemberFact;
use crate::project::{ProjectAdded, ProjectChanged, ProjectWriteModel};
use crate::saml::{SamlAppAdded, SamlConfigChanged};
use crate::user::{HumanAdded, ProfileChanged, UserWriteModel};
use crate::*;

const INSTANCE: &str = "inst-1";

struct Fixture {
    _dir: tempfile::TempDir,
    clock: ManualClock,
    commands: Commands,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("domain.db");
    let pool = create_pool(path.to_str().expect("utf-8 path"), DbRuntimeSettings::default())
        .expect("pool creation should succeed");
    {
        let conn = pool.get().expect("should get a connection");
        run_migrations(&conn).expect("migrations should succeed");
    }
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
    let store = Eventstore::with_clock(
        pool,
        registry(),
        Arc::new(clock.clone()),
        EventstoreConfig::default(),
    );
    Fixture {
        _dir: dir,
        clock,
        commands: Commands::new(store),
    }
}

fn admin() -> Actor {
    Actor::new(INSTANCE, "admin")
}

fn human(username: &str) -> HumanAdded {
    HumanAdded {
        username: username.into(),
        first_name: "Ada".into(),
        last_name: "Lovelace".into(),
        email: format!("{username}@example.com"),
        preferred_language: None,
    }
}

fn project(name: &str) -> ProjectAdded {
    ProjectAdded {
        name: name.into(),
        role_assertion: false,
    }
}

async fn seed_org(commands: &Commands, actor: &Actor, org_id: &str) {
    commands
        .add_org(actor, org_id, &format!("{org_id} inc"))
        .await
        .expect("org should be added");
}

// ── registry ─────────────────────────────────────────────────────────

#[test]
fn registry_knows_every_family() {
    let registry = registry();
    assert_eq!(registry.len(), 18);
    assert!(registry.contains(user::AGGREGATE_TYPE, user::HUMAN_ADDED));
    assert!(registry.contains(project::AGGREGATE_TYPE, project::MEMBER_CHANGED));
    assert!(registry.contains(saml::AGGREGATE_TYPE, saml::CONFIG_CHANGED));
    assert!(registry.contains(keypair::AGGREGATE_TYPE, keypair::ADDED));
    assert!(!registry.contains(user::AGGREGATE_TYPE, "user.machine.added"));
}

// ── users ────────────────────────────────────────────────────────────

#[tokio::test]
async fn user_lifecycle() {
    let f = fixture();
    let actor = admin();
    seed_org(&f.commands, &actor, "org-1").await;

    let added = f
        .commands
        .add_human_user(&actor, "org-1", "u1", human("ada"))
        .await
        .expect("user should be added");
    assert_eq!(added.sequence, 1);
    assert_eq!(added.resource_owner, "org-1");

    let changed = f
        .commands
        .change_username(&actor, "u1", "countess")
        .await
        .expect("username should change");
    assert_eq!(changed.sequence, 2);
    assert!(changed.position > added.position);

    let loaded = f
        .commands
        .store()
        .load(UserWriteModel::new(INSTANCE, "u1"), Deadline::NONE)
        .await
        .expect("load should succeed");
    assert!(loaded.model.is_active());
    assert_eq!(loaded.model.username, "countess");
    assert_eq!(loaded.processed_sequence, 2);

    let hits = f
        .commands
        .store()
        .search_fields(&InstanceId::new(INSTANCE), user::AGGREGATE_TYPE, "username", json!("countess"))
        .await
        .expect("search should succeed");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].aggregate_id, "u1");
}

#[tokio::test]
async fn usernames_are_unique_until_released() {
    let f = fixture();
    let actor = admin();
    seed_org(&f.commands, &actor, "org-1").await;
    f.commands
        .add_human_user(&actor, "org-1", "u1", human("ada"))
        .await
        .expect("first user should be added");

    let err = f
        .commands
        .add_human_user(&actor, "org-1", "u2", human("ada"))
        .await
        .expect_err("duplicate username should be rejected");
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(err.message(), "Errors.User.AlreadyExists");

    f.commands
        .change_username(&actor, "u1", "countess")
        .await
        .expect("rename should succeed");
    f.commands
        .add_human_user(&actor, "org-1", "u2", human("ada"))
        .await
        .expect("released username should be reusable");
}

#[tokio::test]
async fn removed_user_releases_username_and_fields() {
    let f = fixture();
    let actor = admin();
    seed_org(&f.commands, &actor, "org-1").await;
    f.commands
        .add_human_user(&actor, "org-1", "u1", human("ada"))
        .await
        .expect("user should be added");
    f.commands
        .remove_user(&actor, "u1")
        .await
        .expect("user should be removed");

    let hits = f
        .commands
        .store()
        .search_fields(&InstanceId::new(INSTANCE), user::AGGREGATE_TYPE, "username", json!("ada"))
        .await
        .expect("search should succeed");
    assert!(hits.is_empty());

    let err = f
        .commands
        .change_username(&actor, "u1", "again")
        .await
        .expect_err("removed user cannot change");
    assert_eq!(err.kind(), ErrorKind::NotFound);

    f.commands
        .add_human_user(&actor, "org-1", "u2", human("ada"))
        .await
        .expect("username should be free again");
}

#[tokio::test]
async fn profile_change_requires_a_difference() {
    let f = fixture();
    let actor = admin();
    seed_org(&f.commands, &actor, "org-1").await;
    f.commands
        .add_human_user(&actor, "org-1", "u1", human("ada"))
        .await
        .expect("user should be added");

    let err = f
        .commands
        .change_profile(
            &actor,
            "u1",
            ProfileChanged {
                first_name: Some("Ada".into()),
                ..ProfileChanged::default()
            },
        )
        .await
        .expect_err("unchanged profile should be rejected");
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

    let details = f
        .commands
        .change_profile(
            &actor,
            "u1",
            ProfileChanged {
                first_name: Some("Ada".into()),
                nick_name: Some("Countess".into()),
                ..ProfileChanged::default()
            },
        )
        .await
        .expect("profile should change");
    assert_eq!(details.sequence, 2);

    let err = f
        .commands
        .change_profile(&actor, "missing", ProfileChanged::default())
        .await
        .expect_err("missing user should be rejected");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn user_requires_an_existing_org() {
    let f = fixture();
    let err = f
        .commands
        .add_human_user(&admin(), "org-404", "u1", human("ada"))
        .await
        .expect_err("missing org should be rejected");
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    assert_eq!(err.message(), "Errors.Org.NotFound");

    let err = f
        .commands
        .add_human_user(&admin(), "org-404", "u1", human(""))
        .await
        .expect_err("empty username should be rejected");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn stale_write_model_conflicts() {
    let f = fixture();
    let actor = admin();
    seed_org(&f.commands, &actor, "org-1").await;
    f.commands
        .add_human_user(&actor, "org-1", "u1", human("ada"))
        .await
        .expect("user should be added");
    let stale = f
        .commands
        .store()
        .load(UserWriteModel::new(INSTANCE, "u1"), Deadline::NONE)
        .await
        .expect("load should succeed");

    f.commands
        .change_username(&actor, "u1", "countess")
        .await
        .expect("concurrent change should succeed");

    let aggregate = warden_eventstore::Aggregate::new(INSTANCE, "org-1", user::AGGREGATE_TYPE, "u1");
    let command = Command::from_event(
        aggregate.clone(),
        "admin",
        &user::UserEvent::ProfileChanged(ProfileChanged {
            nick_name: Some("late".into()),
            ..ProfileChanged::default()
        }),
    )
    .expect("command should build");
    let err = f
        .commands
        .store()
        .push(
            PushIntent::new(INSTANCE)
                .command(command)
                .expect(&aggregate, Expected::Exactly(stale.processed_sequence)),
        )
        .await
        .expect_err("stale token should conflict");
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

// ── projects ─────────────────────────────────────────────────────────

#[tokio::test]
async fn project_names_are_unique_per_org() {
    let f = fixture();
    let actor = admin();
    seed_org(&f.commands, &actor, "org-1").await;
    seed_org(&f.commands, &actor, "org-2").await;

    f.commands
        .add_project(&actor, "org-1", "p1", project("X"))
        .await
        .expect("first project should be added");
    f.commands
        .add_project(&actor, "org-2", "p2", project("X"))
        .await
        .expect("same name in another org should be accepted");

    let err = f
        .commands
        .add_project(&actor, "org-1", "p3", project("X"))
        .await
        .expect_err("same name in same org should be rejected");
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(err.message(), "Errors.Project.AlreadyExists");

    f.commands
        .change_project(
            &actor,
            "p1",
            ProjectChanged {
                name: Some("Y".into()),
                ..ProjectChanged::default()
            },
        )
        .await
        .expect("rename should succeed");
    f.commands
        .add_project(&actor, "org-1", "p3", project("X"))
        .await
        .expect("released name should be reusable");
}

#[tokio::test]
async fn project_change_without_difference_is_rejected() {
    let f = fixture();
    let actor = admin();
    seed_org(&f.commands, &actor, "org-1").await;
    f.commands
        .add_project(&actor, "org-1", "p1", project("X"))
        .await
        .expect("project should be added");

    let err = f
        .commands
        .change_project(
            &actor,
            "p1",
            ProjectChanged {
                name: Some("X".into()),
                ..ProjectChanged::default()
            },
        )
        .await
        .expect_err("no-op change should be rejected");
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
}

#[tokio::test]
async fn project_members() {
    let f = fixture();
    let actor = admin();
    seed_org(&f.commands, &actor, "org-1").await;
    f.commands
        .add_project(&actor, "org-1", "p1", project("X"))
        .await
        .expect("project should be added");

    let err = f
        .commands
        .add_project_member(&actor, "p1", MemberFact::new("u1", ["PROJECT_OWNER"]))
        .await
        .expect_err("unknown user should be rejected");
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

    f.commands
        .add_human_user(&actor, "org-1", "u1", human("ada"))
        .await
        .expect("user should be added");
    f.commands
        .add_project_member(&actor, "p1", MemberFact::new("u1", ["PROJECT_OWNER"]))
        .await
        .expect("member should be added");

    let err = f
        .commands
        .add_project_member(&actor, "p1", MemberFact::new("u1", ["PROJECT_OWNER"]))
        .await
        .expect_err("duplicate member should be rejected");
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let err = f
        .commands
        .add_project_member(&actor, "p1", MemberFact::new("u1", Vec::<String>::new()))
        .await
        .expect_err("member without roles should be rejected");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    f.commands
        .change_project_member(&actor, "p1", MemberFact::new("u1", ["PROJECT_VIEWER"]))
        .await
        .expect("roles should change");
    let loaded = f
        .commands
        .store()
        .load(ProjectWriteModel::new(INSTANCE, "p1"), Deadline::NONE)
        .await
        .expect("load should succeed");
    assert_eq!(
        loaded.model.member("u1").map(|m| m.roles.clone()),
        Some(vec!["PROJECT_VIEWER".to_string()])
    );

    f.commands
        .remove_project_member(&actor, "p1", "u1")
        .await
        .expect("member should be removed");
    f.commands
        .add_project_member(&actor, "p1", MemberFact::new("u1", ["PROJECT_OWNER"]))
        .await
        .expect("member can be added again after removal");
}

// ── SAML applications ────────────────────────────────────────────────

async fn seed_project(commands: &Commands, actor: &Actor) {
    seed_org(commands, actor, "org-1").await;
    commands
        .add_project(actor, "org-1", "p1", project("X"))
        .await
        .expect("project should be added");
}

fn saml_app(entity_id: &str) -> SamlAppAdded {
    SamlAppAdded {
        project_id: "p1".into(),
        name: "portal".into(),
        entity_id: entity_id.into(),
        metadata_url: None,
    }
}

#[tokio::test]
async fn saml_entity_ids_are_unique_across_instances() {
    let f = fixture();
    let first = Actor::new("inst-a", "admin");
    let second = Actor::new("inst-b", "admin");
    seed_project(&f.commands, &first).await;
    seed_project(&f.commands, &second).await;

    let added = f
        .commands
        .add_saml_app(&first, "app-1", saml_app("https://sp.example.com"))
        .await
        .expect("app should be added");
    assert_eq!(added.resource_owner, "org-1");

    let err = f
        .commands
        .add_saml_app(&second, "app-1", saml_app("https://sp.example.com"))
        .await
        .expect_err("entity id taken in another instance");
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(err.message(), "Errors.Project.App.SAMLEntityIDAlreadyExists");

    f.commands
        .remove_saml_app(&first, "app-1")
        .await
        .expect("app should be removed");
    f.commands
        .add_saml_app(&second, "app-1", saml_app("https://sp.example.com"))
        .await
        .expect("released entity id should be reusable");
}

#[tokio::test]
async fn saml_config_change_moves_entity_id() {
    let f = fixture();
    let actor = admin();
    seed_project(&f.commands, &actor).await;
    f.commands
        .add_saml_app(&actor, "app-1", saml_app("urn:one"))
        .await
        .expect("app should be added");

    f.commands
        .change_saml_config(
            &actor,
            "app-1",
            SamlConfigChanged {
                entity_id: Some("urn:two".into()),
                ..SamlConfigChanged::default()
            },
        )
        .await
        .expect("entity id should change");

    f.commands
        .add_saml_app(&actor, "app-2", saml_app("urn:one"))
        .await
        .expect("old entity id should be free");
    let err = f
        .commands
        .add_saml_app(&actor, "app-3", saml_app("urn:two"))
        .await
        .expect_err("new entity id should be taken");
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let err = f
        .commands
        .add_saml_app(&actor, "app-4", SamlAppAdded {
            project_id: "p-missing".into(),
            ..saml_app("urn:three")
        })
        .await
        .expect_err("missing project should be rejected");
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
}

// ── key pairs ────────────────────────────────────────────────────────

fn key(usage: KeyUsage, from: chrono::DateTime<Utc>, lifetime: Duration) -> KeyPairAdded {
    KeyPairAdded {
        usage,
        algorithm: "ed25519".into(),
        private_key: SealedKey {
            cipher: "chacha20poly1305".into(),
            data: "00".into(),
        },
        public_key: "11".into(),
        fingerprint: "22".into(),
        not_before: from,
        not_after: from + lifetime,
    }
}

async fn active_keys(
    commands: &Commands,
    usage: KeyUsage,
    at: chrono::DateTime<Utc>,
) -> warden_eventstore::Reduced<ActiveKeysWriteModel> {
    commands
        .store()
        .load(ActiveKeysWriteModel::new(INSTANCE, usage, at), Deadline::NONE)
        .await
        .expect("load should succeed")
}

#[tokio::test]
async fn active_keys_respect_usage_and_validity() {
    let f = fixture();
    let actor = admin();
    let now = f.clock.now();

    let details = f
        .commands
        .add_key_pair(&actor, "k1", key(KeyUsage::SamlResponseSigning, now, Duration::days(1)))
        .await
        .expect("key should be added");
    assert_eq!(details.resource_owner, INSTANCE);

    let active = active_keys(&f.commands, KeyUsage::SamlResponseSigning, now + Duration::hours(1)).await;
    assert_eq!(active.model.keys.len(), 1);
    assert_eq!(active.model.newest().map(|k| k.key_id.as_str()), Some("k1"));

    let expired = active_keys(&f.commands, KeyUsage::SamlResponseSigning, now + Duration::days(2)).await;
    assert!(expired.model.keys.is_empty());
    assert!(expired.exists());

    let other = active_keys(&f.commands, KeyUsage::SamlCa, now + Duration::hours(1)).await;
    assert!(other.model.keys.is_empty());

    let err = f
        .commands
        .add_key_pair(&actor, "k2", key(KeyUsage::SamlCa, now, Duration::zero()))
        .await
        .expect_err("empty validity should be rejected");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}
