//! Command side: validate an intent against current state, then push.
//!
//! Every mutation loads the write model of its aggregate first and passes
//! the model's processed sequence as the push expectation, so a concurrent
//! writer between load and push surfaces as `Conflict`.

use chrono::{DateTime, Utc};
use warden_eventstore::{
    Aggregate, Command, Deadline, EventFamily, Eventstore, Expected, Position, PushIntent,
    Reduced, StoredEvent, WriteModel,
};
use warden_types::{Error, ErrorKind, InstanceId, Result};

use crate::keypair::{self, KeyPairAdded, KeyPairEvent};
use crate::member::{MemberFact, RemovedMember};
use crate::org::{self, OrgAdded, OrgEvent, OrgRemoved, OrgWriteModel};
use crate::project::{self, ProjectAdded, ProjectChanged, ProjectEvent, ProjectRemoved, ProjectWriteModel};
use crate::saml::{self, SamlAppAdded, SamlAppEvent, SamlAppRemoved, SamlAppWriteModel, SamlConfigChanged};
use crate::user::{
    self, HumanAdded, ProfileChanged, UserEvent, UserRemoved, UserWriteModel, UsernameChanged,
};
use crate::DomainEvent;

/// Who issues a command and in which instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub instance_id: InstanceId,
    /// Recorded as the creator of every event the command appends.
    pub user_id: String,
}

impl Actor {
    pub fn new(instance_id: impl Into<InstanceId>, user_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// Outcome of a successful command.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDetails {
    pub sequence: u64,
    pub position: Position,
    pub resource_owner: String,
    pub changed_at: DateTime<Utc>,
}

impl ObjectDetails {
    fn from_last(events: &[StoredEvent]) -> Result<Self> {
        let last = events
            .last()
            .ok_or_else(|| Error::internal("push returned no events"))?;
        Ok(Self {
            sequence: last.sequence,
            position: last.position,
            resource_owner: last.aggregate.resource_owner.clone(),
            changed_at: last.created_at,
        })
    }
}

/// Validated mutations over the domain aggregates.
#[derive(Debug, Clone)]
pub struct Commands {
    store: Eventstore<DomainEvent>,
}

impl Commands {
    pub fn new(store: Eventstore<DomainEvent>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Eventstore<DomainEvent> {
        &self.store
    }

    async fn load<M: WriteModel<DomainEvent>>(&self, model: M) -> Result<Reduced<M>> {
        self.store.load(model, Deadline::NONE).await
    }

    /// Pushes `events` onto one aggregate, expecting it at `expected`.
    async fn push<F: EventFamily>(
        &self,
        actor: &Actor,
        aggregate: Aggregate,
        expected: Expected,
        events: &[F],
    ) -> Result<ObjectDetails> {
        let commands = events
            .iter()
            .map(|event| Command::from_event(aggregate.clone(), actor.user_id.clone(), event))
            .collect::<Result<Vec<_>>>()?;
        let intent = PushIntent::new(actor.instance_id.clone())
            .commands(commands)
            .expect(&aggregate, expected);
        let pushed = self.store.push(intent).await?;
        ObjectDetails::from_last(&pushed)
    }

    fn aggregate<M>(actor: &Actor, loaded: &Reduced<M>, aggregate_type: &str, id: &str) -> Aggregate {
        Aggregate::new(
            actor.instance_id.clone(),
            loaded.resource_owner.clone().unwrap_or_default(),
            aggregate_type,
            id,
        )
    }

    // ── users ─────────────────────────────────────────────────────────

    /// Registers a human user owned by `org_id`.
    #[tracing::instrument(skip(self, actor, human), fields(instance_id = %actor.instance_id))]
    pub async fn add_human_user(
        &self,
        actor: &Actor,
        org_id: &str,
        user_id: &str,
        human: HumanAdded,
    ) -> Result<ObjectDetails> {
        require(user_id, "Errors.User.IDMissing")?;
        require(&human.username, "Errors.User.Username.Empty")?;
        require(&human.email, "Errors.User.Email.Empty")?;
        self.require_org(actor, org_id)
            .await
            .map_err(|e| missing_as_precondition(e, "Errors.Org.NotFound"))?;

        let loaded = self.load(UserWriteModel::new(actor.instance_id.clone(), user_id)).await?;
        if loaded.exists() {
            return Err(Error::already_exists("Errors.User.AlreadyExists"));
        }
        let aggregate = Aggregate::new(actor.instance_id.clone(), org_id, user::AGGREGATE_TYPE, user_id);
        self.push(actor, aggregate, Expected::NEW, &[UserEvent::HumanAdded(human)])
            .await
    }

    #[tracing::instrument(skip(self, actor), fields(instance_id = %actor.instance_id))]
    pub async fn change_username(
        &self,
        actor: &Actor,
        user_id: &str,
        username: &str,
    ) -> Result<ObjectDetails> {
        require(username, "Errors.User.Username.Empty")?;
        let loaded = self.active_user(actor, user_id).await?;
        if loaded.model.username == username {
            return Err(Error::precondition_failed("Errors.User.Username.NotChanged"));
        }
        let aggregate = Self::aggregate(actor, &loaded, user::AGGREGATE_TYPE, user_id);
        let event = UserEvent::UsernameChanged(UsernameChanged {
            username: username.to_string(),
            old_username: loaded.model.username.clone(),
        });
        self.push(actor, aggregate, Expected::Exactly(loaded.processed_sequence), &[event])
            .await
    }

    /// Applies the fields of `change` that differ from the current profile.
    #[tracing::instrument(skip(self, actor, change), fields(instance_id = %actor.instance_id))]
    pub async fn change_profile(
        &self,
        actor: &Actor,
        user_id: &str,
        change: ProfileChanged,
    ) -> Result<ObjectDetails> {
        let loaded = self.active_user(actor, user_id).await?;
        let diff = loaded.model.profile_diff(&change);
        if diff.is_empty() {
            return Err(Error::precondition_failed("Errors.User.Profile.NotChanged"));
        }
        let aggregate = Self::aggregate(actor, &loaded, user::AGGREGATE_TYPE, user_id);
        self.push(
            actor,
            aggregate,
            Expected::Exactly(loaded.processed_sequence),
            &[UserEvent::ProfileChanged(diff)],
        )
        .await
    }

    #[tracing::instrument(skip(self, actor), fields(instance_id = %actor.instance_id))]
    pub async fn remove_user(&self, actor: &Actor, user_id: &str) -> Result<ObjectDetails> {
        let loaded = self.active_user(actor, user_id).await?;
        let aggregate = Self::aggregate(actor, &loaded, user::AGGREGATE_TYPE, user_id);
        let event = UserEvent::Removed(UserRemoved {
            username: loaded.model.username.clone(),
        });
        self.push(actor, aggregate, Expected::Exactly(loaded.processed_sequence), &[event])
            .await
    }

    async fn active_user(&self, actor: &Actor, user_id: &str) -> Result<Reduced<UserWriteModel>> {
        require(user_id, "Errors.User.IDMissing")?;
        let loaded = self.load(UserWriteModel::new(actor.instance_id.clone(), user_id)).await?;
        if !loaded.model.is_active() {
            return Err(Error::not_found("Errors.User.NotFound"));
        }
        Ok(loaded)
    }

    // ── organizations ─────────────────────────────────────────────────

    /// Creates an organization. The organization owns itself.
    #[tracing::instrument(skip(self, actor), fields(instance_id = %actor.instance_id))]
    pub async fn add_org(&self, actor: &Actor, org_id: &str, name: &str) -> Result<ObjectDetails> {
        require(org_id, "Errors.Org.IDMissing")?;
        require(name, "Errors.Org.Invalid")?;
        let loaded = self.load(OrgWriteModel::new(actor.instance_id.clone(), org_id)).await?;
        if loaded.exists() {
            return Err(Error::already_exists("Errors.Org.AlreadyExists"));
        }
        let aggregate = Aggregate::new(actor.instance_id.clone(), org_id, org::AGGREGATE_TYPE, org_id);
        let event = OrgEvent::Added(OrgAdded {
            name: name.to_string(),
        });
        self.push(actor, aggregate, Expected::NEW, &[event]).await
    }

    #[tracing::instrument(skip(self, actor), fields(instance_id = %actor.instance_id))]
    pub async fn remove_org(&self, actor: &Actor, org_id: &str) -> Result<ObjectDetails> {
        let loaded = self.require_org(actor, org_id).await?;
        let aggregate = Self::aggregate(actor, &loaded, org::AGGREGATE_TYPE, org_id);
        let event = OrgEvent::Removed(OrgRemoved {
            name: loaded.model.name.clone(),
        });
        self.push(actor, aggregate, Expected::Exactly(loaded.processed_sequence), &[event])
            .await
    }

    #[tracing::instrument(skip(self, actor, member), fields(instance_id = %actor.instance_id))]
    pub async fn add_org_member(
        &self,
        actor: &Actor,
        org_id: &str,
        member: MemberFact,
    ) -> Result<ObjectDetails> {
        validate_member(&member)?;
        let loaded = self.require_org(actor, org_id).await?;
        if loaded.model.members.iter().any(|m| m.user_id == member.user_id) {
            return Err(Error::already_exists("Errors.Org.Member.AlreadyExists"));
        }
        self.active_user(actor, &member.user_id)
            .await
            .map_err(|e| missing_as_precondition(e, "Errors.User.NotFound"))?;
        let aggregate = Self::aggregate(actor, &loaded, org::AGGREGATE_TYPE, org_id);
        self.push(
            actor,
            aggregate,
            Expected::Exactly(loaded.processed_sequence),
            &[OrgEvent::MemberAdded(member)],
        )
        .await
    }

    async fn require_org(&self, actor: &Actor, org_id: &str) -> Result<Reduced<OrgWriteModel>> {
        require(org_id, "Errors.Org.IDMissing")?;
        let loaded = self.load(OrgWriteModel::new(actor.instance_id.clone(), org_id)).await?;
        if !loaded.model.is_active() {
            return Err(Error::not_found("Errors.Org.NotFound"));
        }
        Ok(loaded)
    }

    // ── projects ──────────────────────────────────────────────────────

    #[tracing::instrument(skip(self, actor, project), fields(instance_id = %actor.instance_id))]
    pub async fn add_project(
        &self,
        actor: &Actor,
        org_id: &str,
        project_id: &str,
        project: ProjectAdded,
    ) -> Result<ObjectDetails> {
        require(project_id, "Errors.Project.IDMissing")?;
        require(&project.name, "Errors.Project.Invalid")?;
        self.require_org(actor, org_id)
            .await
            .map_err(|e| missing_as_precondition(e, "Errors.Org.NotFound"))?;
        let loaded = self.load(ProjectWriteModel::new(actor.instance_id.clone(), project_id)).await?;
        if loaded.exists() {
            return Err(Error::already_exists("Errors.Project.AlreadyExists"));
        }
        let aggregate = Aggregate::new(
            actor.instance_id.clone(),
            org_id,
            project::AGGREGATE_TYPE,
            project_id,
        );
        self.push(actor, aggregate, Expected::NEW, &[ProjectEvent::Added(project)])
            .await
    }

    /// Applies the fields of `change` that differ from the current project.
    #[tracing::instrument(skip(self, actor, change), fields(instance_id = %actor.instance_id))]
    pub async fn change_project(
        &self,
        actor: &Actor,
        project_id: &str,
        change: ProjectChanged,
    ) -> Result<ObjectDetails> {
        if change.name.as_deref() == Some("") {
            return Err(Error::invalid_argument("Errors.Project.Invalid"));
        }
        let loaded = self.active_project(actor, project_id).await?;
        let diff = loaded.model.diff(&change);
        if diff.is_empty() {
            return Err(Error::precondition_failed("Errors.Project.NotChanged"));
        }
        let aggregate = Self::aggregate(actor, &loaded, project::AGGREGATE_TYPE, project_id);
        self.push(
            actor,
            aggregate,
            Expected::Exactly(loaded.processed_sequence),
            &[ProjectEvent::Changed(diff)],
        )
        .await
    }

    #[tracing::instrument(skip(self, actor), fields(instance_id = %actor.instance_id))]
    pub async fn remove_project(&self, actor: &Actor, project_id: &str) -> Result<ObjectDetails> {
        let loaded = self.active_project(actor, project_id).await?;
        let aggregate = Self::aggregate(actor, &loaded, project::AGGREGATE_TYPE, project_id);
        let event = ProjectEvent::Removed(ProjectRemoved {
            name: loaded.model.name.clone(),
        });
        self.push(actor, aggregate, Expected::Exactly(loaded.processed_sequence), &[event])
            .await
    }

    #[tracing::instrument(skip(self, actor, member), fields(instance_id = %actor.instance_id))]
    pub async fn add_project_member(
        &self,
        actor: &Actor,
        project_id: &str,
        member: MemberFact,
    ) -> Result<ObjectDetails> {
        validate_member(&member)?;
        let loaded = self.active_project(actor, project_id).await?;
        if loaded.model.member(&member.user_id).is_some() {
            return Err(Error::already_exists("Errors.Project.Member.AlreadyExists"));
        }
        self.active_user(actor, &member.user_id)
            .await
            .map_err(|e| missing_as_precondition(e, "Errors.User.NotFound"))?;
        let aggregate = Self::aggregate(actor, &loaded, project::AGGREGATE_TYPE, project_id);
        self.push(
            actor,
            aggregate,
            Expected::Exactly(loaded.processed_sequence),
            &[ProjectEvent::MemberAdded(member)],
        )
        .await
    }

    #[tracing::instrument(skip(self, actor, member), fields(instance_id = %actor.instance_id))]
    pub async fn change_project_member(
        &self,
        actor: &Actor,
        project_id: &str,
        member: MemberFact,
    ) -> Result<ObjectDetails> {
        validate_member(&member)?;
        let loaded = self.active_project(actor, project_id).await?;
        let current = loaded
            .model
            .member(&member.user_id)
            .ok_or_else(|| Error::not_found("Errors.Project.Member.NotFound"))?;
        if current.roles == member.roles {
            return Err(Error::precondition_failed("Errors.Project.Member.RolesNotChanged"));
        }
        let aggregate = Self::aggregate(actor, &loaded, project::AGGREGATE_TYPE, project_id);
        self.push(
            actor,
            aggregate,
            Expected::Exactly(loaded.processed_sequence),
            &[ProjectEvent::MemberChanged(member)],
        )
        .await
    }

    #[tracing::instrument(skip(self, actor), fields(instance_id = %actor.instance_id))]
    pub async fn remove_project_member(
        &self,
        actor: &Actor,
        project_id: &str,
        user_id: &str,
    ) -> Result<ObjectDetails> {
        let loaded = self.active_project(actor, project_id).await?;
        if loaded.model.member(user_id).is_none() {
            return Err(Error::not_found("Errors.Project.Member.NotFound"));
        }
        let aggregate = Self::aggregate(actor, &loaded, project::AGGREGATE_TYPE, project_id);
        let event = ProjectEvent::MemberRemoved(RemovedMember {
            user_id: user_id.to_string(),
        });
        self.push(actor, aggregate, Expected::Exactly(loaded.processed_sequence), &[event])
            .await
    }

    async fn active_project(
        &self,
        actor: &Actor,
        project_id: &str,
    ) -> Result<Reduced<ProjectWriteModel>> {
        require(project_id, "Errors.Project.IDMissing")?;
        let loaded = self.load(ProjectWriteModel::new(actor.instance_id.clone(), project_id)).await?;
        if !loaded.model.is_active() {
            return Err(Error::not_found("Errors.Project.NotFound"));
        }
        Ok(loaded)
    }

    // ── SAML applications ─────────────────────────────────────────────

    /// Adds a SAML app to an active project. The app shares the project's
    /// owner.
    #[tracing::instrument(skip(self, actor, app), fields(instance_id = %actor.instance_id))]
    pub async fn add_saml_app(
        &self,
        actor: &Actor,
        app_id: &str,
        app: SamlAppAdded,
    ) -> Result<ObjectDetails> {
        require(app_id, "Errors.Project.App.IDMissing")?;
        require(&app.name, "Errors.Project.App.Invalid")?;
        require(&app.entity_id, "Errors.Project.App.SAMLEntityIDMissing")?;
        let project = self
            .active_project(actor, &app.project_id)
            .await
            .map_err(|e| missing_as_precondition(e, "Errors.Project.NotFound"))?;
        let loaded = self.load(SamlAppWriteModel::new(actor.instance_id.clone(), app_id)).await?;
        if loaded.exists() {
            return Err(Error::already_exists("Errors.Project.App.AlreadyExists"));
        }
        let aggregate = Aggregate::new(
            actor.instance_id.clone(),
            project.resource_owner.clone().unwrap_or_default(),
            saml::AGGREGATE_TYPE,
            app_id,
        );
        self.push(actor, aggregate, Expected::NEW, &[SamlAppEvent::Added(app)])
            .await
    }

    #[tracing::instrument(skip(self, actor, change), fields(instance_id = %actor.instance_id))]
    pub async fn change_saml_config(
        &self,
        actor: &Actor,
        app_id: &str,
        change: SamlConfigChanged,
    ) -> Result<ObjectDetails> {
        if change.entity_id.as_deref() == Some("") {
            return Err(Error::invalid_argument("Errors.Project.App.SAMLEntityIDMissing"));
        }
        let loaded = self.active_saml_app(actor, app_id).await?;
        let current = &loaded.model;
        let diff = SamlConfigChanged {
            entity_id: change.entity_id.filter(|id| *id != current.entity_id),
            old_entity_id: current.entity_id.clone(),
            metadata_url: change
                .metadata_url
                .filter(|url| current.metadata_url.as_ref() != Some(url)),
        };
        if diff.entity_id.is_none() && diff.metadata_url.is_none() {
            return Err(Error::precondition_failed("Errors.Project.App.SAMLConfigNotChanged"));
        }
        let aggregate = Self::aggregate(actor, &loaded, saml::AGGREGATE_TYPE, app_id);
        self.push(
            actor,
            aggregate,
            Expected::Exactly(loaded.processed_sequence),
            &[SamlAppEvent::ConfigChanged(diff)],
        )
        .await
    }

    #[tracing::instrument(skip(self, actor), fields(instance_id = %actor.instance_id))]
    pub async fn remove_saml_app(&self, actor: &Actor, app_id: &str) -> Result<ObjectDetails> {
        let loaded = self.active_saml_app(actor, app_id).await?;
        let aggregate = Self::aggregate(actor, &loaded, saml::AGGREGATE_TYPE, app_id);
        let event = SamlAppEvent::Removed(SamlAppRemoved {
            entity_id: loaded.model.entity_id.clone(),
        });
        self.push(actor, aggregate, Expected::Exactly(loaded.processed_sequence), &[event])
            .await
    }

    async fn active_saml_app(
        &self,
        actor: &Actor,
        app_id: &str,
    ) -> Result<Reduced<SamlAppWriteModel>> {
        require(app_id, "Errors.Project.App.IDMissing")?;
        let loaded = self.load(SamlAppWriteModel::new(actor.instance_id.clone(), app_id)).await?;
        if !loaded.model.exists {
            return Err(Error::not_found("Errors.Project.App.NotFound"));
        }
        Ok(loaded)
    }

    // ── key pairs ─────────────────────────────────────────────────────

    /// Records a generated key pair. Key pairs belong to the instance itself.
    #[tracing::instrument(skip(self, actor, key), fields(instance_id = %actor.instance_id, usage = %key.usage))]
    pub async fn add_key_pair(
        &self,
        actor: &Actor,
        key_id: &str,
        key: KeyPairAdded,
    ) -> Result<ObjectDetails> {
        require(key_id, "Errors.KeyPair.IDMissing")?;
        if key.not_after <= key.not_before {
            return Err(Error::invalid_argument("Errors.KeyPair.InvalidValidity"));
        }
        let aggregate = Aggregate::new(
            actor.instance_id.clone(),
            actor.instance_id.as_str(),
            keypair::AGGREGATE_TYPE,
            key_id,
        );
        self.push(actor, aggregate, Expected::NEW, &[KeyPairEvent::Added(key)])
            .await
    }
}

fn require(value: &str, message: &'static str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::invalid_argument(message));
    }
    Ok(())
}

fn validate_member(member: &MemberFact) -> Result<()> {
    require(&member.user_id, "Errors.User.IDMissing")?;
    if member.roles.is_empty() || member.roles.iter().any(|r| r.trim().is_empty()) {
        return Err(Error::invalid_argument("Errors.Member.Roles.Invalid"));
    }
    Ok(())
}

/// A referenced aggregate that is missing makes the command's precondition
/// fail; other errors pass through.
fn missing_as_precondition(err: Error, message: &'static str) -> Error {
    if err.is(ErrorKind::NotFound) {
        Error::precondition_failed(message)
    } else {
        err
    }
}
