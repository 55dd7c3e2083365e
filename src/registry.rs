//! Actor registry: announcements, liveness, predicate matching and group
//! capacity checks.
//!
//! Actor records live in the store; this module owns their lifecycle.
//! Eviction is a best-effort sweep and is deliberately not transactional
//! with acquisition.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::model::{Actor, ActorGroup, RequiredActor};
use crate::notify::Notifier;
use crate::predicate::{Predicate, PredicateError};
use crate::store::{ActorPatch, ActorStore, Store};

pub struct ActorRegistry {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
}

impl ActorRegistry {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Handle an actor announcement. First announce creates the record;
    /// re-announcing is idempotent and only refreshes liveness, tags and ip.
    pub async fn announce(
        &self,
        actor_id: &str,
        actor_type: &str,
        tags: Vec<String>,
        ip: Option<String>,
    ) -> EngineResult<Actor> {
        let now = Utc::now();
        let existing = self.store.get_actor(actor_id).await?;
        let actor = match existing {
            Some(mut actor) => {
                actor.tags = tags.clone();
                actor.ip = ip.clone();
                actor.last_seen = now;
                self.store
                    .update_actor(
                        actor_id,
                        ActorPatch {
                            tags: Some(tags),
                            ip: Some(ip),
                            last_seen: Some(now),
                            session_id: None,
                        },
                    )
                    .await?;
                actor
            }
            None => {
                let actor = Actor {
                    id: actor_id.to_string(),
                    actor_type: actor_type.to_string(),
                    tags,
                    ip,
                    last_seen: now,
                    session_id: None,
                };
                self.store.insert_actor(&actor).await?;
                info!(actor_id, actor_type, "actor registered");
                actor
            }
        };
        self.notifier.actors_changed(actor_id).await;
        Ok(actor)
    }

    /// Heartbeat: refresh liveness and metadata for a known actor.
    pub async fn touch(
        &self,
        actor_id: &str,
        tags: Vec<String>,
        ip: Option<String>,
    ) -> EngineResult<()> {
        let updated = self
            .store
            .update_actor(
                actor_id,
                ActorPatch {
                    tags: Some(tags),
                    ip: Some(ip),
                    last_seen: Some(Utc::now()),
                    session_id: None,
                },
            )
            .await?;
        if !updated {
            return Err(EngineError::ActorNotFound(actor_id.to_string()));
        }
        self.notifier.actors_changed(actor_id).await;
        Ok(())
    }

    /// Remove unassigned actors whose last heartbeat is older than
    /// `idle_timeout`. Returns the evicted ids.
    pub async fn evict_idle(&self, idle_timeout: std::time::Duration) -> EngineResult<Vec<String>> {
        let cutoff = Utc::now()
            - TimeDelta::from_std(idle_timeout).unwrap_or_else(|_| TimeDelta::seconds(8));
        let mut evicted = Vec::new();
        for actor in self.store.list_actors().await? {
            if actor.is_free() && actor.last_seen < cutoff {
                if self.store.delete_actor(&actor.id).await? {
                    debug!(actor_id = %actor.id, last_seen = %actor.last_seen, "evicted idle actor");
                    self.notifier.actors_changed(&actor.id).await;
                    evicted.push(actor.id);
                }
            }
        }
        if !evicted.is_empty() {
            metrics::counter!("ensemble_actors_evicted_total").increment(evicted.len() as u64);
        }
        Ok(evicted)
    }
}

/// Filter actors by a tag predicate expression. Malformed expressions fail
/// closed: the caller gets the parse error and no actors match.
pub fn match_by_tag_predicate<'a>(
    actors: &'a [Actor],
    expression: &str,
) -> Result<Vec<&'a Actor>, PredicateError> {
    let predicate = Predicate::parse(expression)?;
    Ok(actors
        .iter()
        .filter(|actor| predicate.matches(&actor.actor_type, &actor.tags))
        .collect())
}

/// Whether an actor satisfies a session requirement: matching type and every
/// tag expression.
pub fn actor_matches_requirement(
    actor: &Actor,
    requirement: &RequiredActor,
) -> Result<bool, PredicateError> {
    if actor.actor_type != requirement.actor_type {
        return Ok(false);
    }
    for expression in &requirement.tags {
        let predicate = Predicate::parse(expression)?;
        if !predicate.matches(&actor.actor_type, &actor.tags) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Count currently-assigned actors belonging to a group.
pub fn assigned_count_in_group(
    actors: &[Actor],
    group: &ActorGroup,
) -> Result<usize, PredicateError> {
    let predicate = Predicate::parse(&group.tag_predicate)?;
    Ok(actors
        .iter()
        .filter(|actor| {
            actor.session_id.is_some() && predicate.matches(&actor.actor_type, &actor.tags)
        })
        .count())
}

/// Groups a candidate actor belongs to.
pub fn groups_for_actor<'a>(
    actor: &Actor,
    groups: &'a [ActorGroup],
) -> Result<Vec<&'a ActorGroup>, PredicateError> {
    let mut matched = Vec::new();
    for group in groups {
        let predicate = Predicate::parse(&group.tag_predicate)?;
        if predicate.matches(&actor.actor_type, &actor.tags) {
            matched.push(group);
        }
    }
    Ok(matched)
}
