use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{LibError, Result};
use crate::models::{
    Like, LikeByRule, LikeByUser, NewRule, NewUser, PageArgs, Rule, RuleId, User, UserId,
};
use crate::page::{self, Page, PageRequest};
use crate::reconcile::{self, EdgeDelta};
use crate::store::{Assign, Store, StoreError, StoreTx};

/// Serialized rulebook actions, one variant per resolver-style entry point.
///
/// Callers must provide a trusted `actor` sourced from validated auth/session state,
/// not from request payloads.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum RulebookOperation {
    UserCreate {
        user: NewUser,
    },
    UserUpdate {
        name: Option<String>,
    },
    UserByEmail {
        email: String,
    },
    Users {
        #[serde(default)]
        args: PageArgs,
        name_like: Option<String>,
    },
    UserRules {
        user_id: UserId,
        #[serde(default)]
        args: PageArgs,
    },
    UserLikes {
        user_id: UserId,
        #[serde(default)]
        args: PageArgs,
    },
    RuleCreate {
        rule: NewRule,
    },
    RuleDelete {
        rule_id: RuleId,
    },
    RuleAuthor {
        rule_id: RuleId,
    },
    RuleLikers {
        rule_id: RuleId,
        #[serde(default)]
        args: PageArgs,
    },
    Rules {
        #[serde(default)]
        args: PageArgs,
        user_id: Option<UserId>,
    },
    LikesUpdate {
        #[serde(default)]
        add: Vec<RuleId>,
        #[serde(default)]
        remove: Vec<RuleId>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LikesUpdate {
    pub added: Vec<RuleId>,
    pub removed: Vec<RuleId>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RulebookOperationResult {
    User {
        user: User,
    },
    UsersPage {
        page: Page<User>,
    },
    Rule {
        rule: Rule,
    },
    RulesPage {
        page: Page<Rule>,
    },
    RuleDeleted {
        #[serde(skip_serializing_if = "Option::is_none")]
        rule_id: Option<RuleId>,
    },
    LikesUpdated {
        likes: LikesUpdate,
    },
}

#[derive(Clone)]
pub struct RulebookOperations<S> {
    store: Arc<S>,
}

impl<S: Store> RulebookOperations<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn from_store(store: &S) -> Self
    where
        S: Clone,
    {
        Self {
            store: Arc::new(store.clone()),
        }
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub async fn execute(
        &self,
        actor: Option<UserId>,
        operation: RulebookOperation,
    ) -> Result<RulebookOperationResult> {
        let result = self.dispatch(actor, operation).await;
        if let Err(err) = &result {
            tracing::error!(
                kind = ?err.kind,
                code = err.code,
                error = %err.source,
                "rulebook operation failed"
            );
        }
        result
    }

    async fn dispatch(
        &self,
        actor: Option<UserId>,
        operation: RulebookOperation,
    ) -> Result<RulebookOperationResult> {
        match operation {
            RulebookOperation::UserCreate { user } => {
                let user = self.user_create(user).await?;
                Ok(RulebookOperationResult::User { user })
            }
            RulebookOperation::UserUpdate { name } => {
                let user = self.user_update(require_actor(actor)?, name).await?;
                Ok(RulebookOperationResult::User { user })
            }
            RulebookOperation::UserByEmail { email } => {
                let user = self.user_by_email(&email).await?;
                Ok(RulebookOperationResult::User { user })
            }
            RulebookOperation::Users { args, name_like } => {
                let page = self.users(args, name_like).await?;
                Ok(RulebookOperationResult::UsersPage { page })
            }
            RulebookOperation::UserRules { user_id, args } => {
                let page = self.user_rules(user_id, args).await?;
                Ok(RulebookOperationResult::RulesPage { page })
            }
            RulebookOperation::UserLikes { user_id, args } => {
                let page = self.user_likes(user_id, args).await?;
                Ok(RulebookOperationResult::RulesPage { page })
            }
            RulebookOperation::RuleCreate { rule } => {
                let rule = self.rule_create(require_actor(actor)?, rule).await?;
                Ok(RulebookOperationResult::Rule { rule })
            }
            RulebookOperation::RuleDelete { rule_id } => {
                let rule_id = self.rule_delete(require_actor(actor)?, rule_id).await?;
                Ok(RulebookOperationResult::RuleDeleted { rule_id })
            }
            RulebookOperation::RuleAuthor { rule_id } => {
                let user = self.rule_author(rule_id).await?;
                Ok(RulebookOperationResult::User { user })
            }
            RulebookOperation::RuleLikers { rule_id, args } => {
                let page = self.rule_likers(rule_id, args).await?;
                Ok(RulebookOperationResult::UsersPage { page })
            }
            RulebookOperation::Rules { args, user_id } => {
                let page = self.rules(args, user_id).await?;
                Ok(RulebookOperationResult::RulesPage { page })
            }
            RulebookOperation::LikesUpdate { add, remove } => {
                let likes = self
                    .likes_update(require_actor(actor)?, add, remove)
                    .await?;
                Ok(RulebookOperationResult::LikesUpdated { likes })
            }
        }
    }

    pub async fn user_create(&self, user: NewUser) -> Result<User> {
        let user = user.normalize()?;
        let draft = User {
            id: UserId::default(),
            name: user.name,
            email: user.email,
            salt: user.digest.salt,
            key: user.digest.key,
        };

        let mut tx = self
            .store
            .begin()
            .await
            .map_err(op_err("Failed to create user"))?;
        // TODO: surface unique violations on users.name / users.email as
        // invalid_input instead of a write conflict.
        let stored = tx
            .insert_one(&draft)
            .await
            .map_err(op_err("Failed to create user"))?;
        tx.commit()
            .await
            .map_err(op_err("Failed to create user"))?;
        Ok(stored)
    }

    pub async fn user_update(&self, actor: UserId, name: Option<String>) -> Result<User> {
        let mut changes = Vec::new();
        if let Some(name) = name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(LibError::invalid(
                    "User name is required",
                    anyhow!("rename to empty name"),
                ));
            }
            changes.push(Assign::new("name", name));
        }

        let mut tx = self
            .store
            .begin()
            .await
            .map_err(op_err("Failed to update user"))?;
        if !changes.is_empty() {
            tx.update::<User>(&changes, &[User::with_id(actor)])
                .await
                .map_err(op_err("Failed to update user"))?;
        }
        let stored: Vec<User> = tx
            .find(&[User::with_id(actor)], None, Some(1))
            .await
            .map_err(op_err("Failed to update user"))?;
        let user = stored.into_iter().next().ok_or_else(|| {
            LibError::not_found("User not found", anyhow!("user {actor} does not exist"))
        })?;
        tx.commit()
            .await
            .map_err(op_err("Failed to update user"))?;
        Ok(user)
    }

    pub async fn user_by_email(&self, email: &str) -> Result<User> {
        let mut tx = self
            .store
            .begin()
            .await
            .map_err(op_err("Failed to look up user"))?;
        let stored: Vec<User> = tx
            .find(&[User::by_email(email)], None, Some(1))
            .await
            .map_err(op_err("Failed to look up user"))?;
        tx.commit()
            .await
            .map_err(op_err("Failed to look up user"))?;
        stored.into_iter().next().ok_or_else(|| {
            LibError::not_found("User not found", anyhow!("no user for email {email}"))
        })
    }

    pub async fn users(&self, args: PageArgs, name_like: Option<String>) -> Result<Page<User>> {
        let mut request = PageRequest::from(args);
        if let Some(pattern) = name_like {
            request = request.filtered(User::name_like(pattern));
        }
        page::read_page(self.store.as_ref(), &request).await
    }

    pub async fn rules(&self, args: PageArgs, author: Option<UserId>) -> Result<Page<Rule>> {
        let mut request = PageRequest::from(args);
        if let Some(author) = author {
            request = request.filtered(Rule::by_user(author));
        }
        page::read_page(self.store.as_ref(), &request).await
    }

    pub async fn user_rules(&self, user_id: UserId, args: PageArgs) -> Result<Page<Rule>> {
        self.rules(args, Some(user_id)).await
    }

    pub async fn user_likes(&self, user_id: UserId, args: PageArgs) -> Result<Page<Rule>> {
        let request = PageRequest::from(args).filtered(Like::by_user(user_id));
        let mut tx = self
            .store
            .begin()
            .await
            .map_err(op_err("Failed to load liked rules"))?;
        let likes: Page<LikeByRule> = page::read_page_tx(&mut tx, &request).await?;

        let targets: Vec<RuleId> = likes.rows.iter().map(|like| like.0.rule_id).collect();
        let fetched: Vec<Rule> = tx
            .find(&[Rule::among(targets.iter().copied())], None, None)
            .await
            .map_err(op_err("Failed to load liked rules"))?;
        tx.commit()
            .await
            .map_err(op_err("Failed to load liked rules"))?;

        let rows = align(
            &targets,
            fetched,
            |rule: &Rule| rule.id,
            "Failed to load liked rules",
        )?;
        Ok(Page {
            rows,
            info: likes.info,
        })
    }

    pub async fn rule_create(&self, actor: UserId, rule: NewRule) -> Result<Rule> {
        let rule = rule.normalize()?;
        let draft = Rule {
            id: RuleId::default(),
            user_id: actor,
            created: Utc::now().naive_utc(),
            summary: rule.summary,
            detail: rule.detail,
        };

        let mut tx = self
            .store
            .begin()
            .await
            .map_err(op_err("Failed to create rule"))?;
        let stored = tx
            .insert_one(&draft)
            .await
            .map_err(op_err("Failed to create rule"))?;
        tx.commit()
            .await
            .map_err(op_err("Failed to create rule"))?;
        Ok(stored)
    }

    /// `None` means nothing matched, whether the rule is missing or belongs
    /// to someone else.
    pub async fn rule_delete(&self, actor: UserId, rule_id: RuleId) -> Result<Option<RuleId>> {
        let mut tx = self
            .store
            .begin()
            .await
            .map_err(op_err("Failed to delete rule"))?;
        let removed: Vec<Rule> = tx
            .delete_batch(&[Rule::with_id(rule_id), Rule::by_user(actor)])
            .await
            .map_err(op_err("Failed to delete rule"))?;
        // The FK cascade covers this on Postgres; the memory store has no cascades.
        if !removed.is_empty() {
            let _: Vec<Like> = tx
                .delete_batch(&[Like::of_rule(rule_id)])
                .await
                .map_err(op_err("Failed to delete rule"))?;
        }
        tx.commit()
            .await
            .map_err(op_err("Failed to delete rule"))?;
        Ok(removed.into_iter().next().map(|rule| rule.id))
    }

    pub async fn rule_author(&self, rule_id: RuleId) -> Result<User> {
        let mut tx = self
            .store
            .begin()
            .await
            .map_err(op_err("Failed to load rule author"))?;
        let rules: Vec<Rule> = tx
            .find(&[Rule::with_id(rule_id)], None, Some(1))
            .await
            .map_err(op_err("Failed to load rule author"))?;
        let rule = rules.into_iter().next().ok_or_else(|| {
            LibError::not_found("Rule not found", anyhow!("rule {rule_id} does not exist"))
        })?;
        let authors: Vec<User> = tx
            .find(&[User::with_id(rule.user_id)], None, Some(1))
            .await
            .map_err(op_err("Failed to load rule author"))?;
        let author = authors.into_iter().next().ok_or_else(|| {
            LibError::not_found(
                "User not found",
                anyhow!("rule {rule_id} points at missing user {}", rule.user_id),
            )
        })?;
        tx.commit()
            .await
            .map_err(op_err("Failed to load rule author"))?;
        Ok(author)
    }

    pub async fn rule_likers(&self, rule_id: RuleId, args: PageArgs) -> Result<Page<User>> {
        let request = PageRequest::from(args).filtered(Like::of_rule(rule_id));
        let mut tx = self
            .store
            .begin()
            .await
            .map_err(op_err("Failed to load rule likers"))?;
        let likes: Page<LikeByUser> = page::read_page_tx(&mut tx, &request).await?;

        let likers: Vec<UserId> = likes.rows.iter().map(|like| like.0.user_id).collect();
        let fetched: Vec<User> = tx
            .find(&[User::among(likers.iter().copied())], None, None)
            .await
            .map_err(op_err("Failed to load rule likers"))?;
        tx.commit()
            .await
            .map_err(op_err("Failed to load rule likers"))?;

        let rows = align(
            &likers,
            fetched,
            |user: &User| user.id,
            "Failed to load rule likers",
        )?;
        Ok(Page {
            rows,
            info: likes.info,
        })
    }

    pub async fn likes_update(
        &self,
        actor: UserId,
        add: Vec<RuleId>,
        remove: Vec<RuleId>,
    ) -> Result<LikesUpdate> {
        let delta = EdgeDelta {
            add: add.into_iter().map(|id| id.0).collect(),
            remove: remove.into_iter().map(|id| id.0).collect(),
        };
        let outcome = reconcile::reconcile::<Like, _>(self.store.as_ref(), actor.0, delta).await?;
        Ok(LikesUpdate {
            added: outcome.added.into_iter().map(RuleId).collect(),
            removed: outcome.removed.into_iter().map(RuleId).collect(),
        })
    }
}

fn require_actor(actor: Option<UserId>) -> Result<UserId> {
    actor.ok_or_else(|| LibError::unauthenticated("You must be signed in for this operation"))
}

fn op_err(public: &'static str) -> impl Fn(StoreError) -> LibError {
    move |err| {
        if matches!(err, StoreError::Conflict { .. }) {
            LibError::from(err)
        } else {
            LibError::database(public, anyhow!(err))
        }
    }
}

/// Reorders `fetched` to follow `keys`; the same-transaction join means
/// every key resolves.
fn align<K, T>(
    keys: &[K],
    fetched: Vec<T>,
    key_of: impl Fn(&T) -> K,
    public: &'static str,
) -> Result<Vec<T>>
where
    K: fmt::Display + Eq + Hash + Copy,
{
    let mut by_key: HashMap<K, T> = fetched
        .into_iter()
        .map(|row| (key_of(&row), row))
        .collect();
    let mut rows = Vec::with_capacity(keys.len());
    for key in keys {
        let row = by_key.remove(key).ok_or_else(|| {
            LibError::database(public, anyhow!("like joins a missing row {key}"))
        })?;
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;
    use crate::memory::MemoryStore;
    use crate::models::PasswordDigest;

    fn ops() -> RulebookOperations<MemoryStore> {
        RulebookOperations::new(Arc::new(MemoryStore::new()))
    }

    fn digest(tag: &str) -> PasswordDigest {
        PasswordDigest {
            key: format!("{tag}-key").into_bytes(),
            salt: format!("{tag}-salt").into_bytes(),
        }
    }

    fn new_user(name: &str, email: &str) -> NewUser {
        NewUser {
            name: name.to_string(),
            email: email.to_string(),
            digest: digest(name),
        }
    }

    fn new_rule(summary: &str) -> NewRule {
        NewRule {
            summary: summary.to_string(),
            detail: None,
        }
    }

    async fn seed_author(ops: &RulebookOperations<MemoryStore>, name: &str) -> User {
        ops.user_create(new_user(name, &format!("{name}@example.com")))
            .await
            .expect("user should be created")
    }

    #[tokio::test]
    async fn user_create_then_fetch_by_email() {
        let ops = ops();
        let created = seed_author(&ops, "ada").await;
        assert!(created.id.0 > 0);

        let fetched = ops
            .user_by_email("ada@example.com")
            .await
            .expect("user should resolve");
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.name, "ada");

        let missing = ops
            .user_by_email("nobody@example.com")
            .await
            .expect_err("unknown email should fail");
        assert_eq!(missing.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn user_create_rejects_taken_emails() {
        let ops = ops();
        seed_author(&ops, "ada").await;

        let err = ops
            .user_create(new_user("ada-two", "ada@example.com"))
            .await
            .expect_err("duplicate email should conflict");
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn user_update_renames_and_returns_fresh_row() {
        let ops = ops();
        let created = seed_author(&ops, "ada").await;

        let renamed = ops
            .user_update(created.id, Some("lovelace".to_string()))
            .await
            .expect("rename should succeed");
        assert_eq!(renamed.name, "lovelace");
        assert_eq!(renamed.email, created.email);

        let unchanged = ops
            .user_update(created.id, None)
            .await
            .expect("no-op update should succeed");
        assert_eq!(unchanged.name, "lovelace");

        let err = ops
            .user_update(created.id, Some("   ".to_string()))
            .await
            .expect_err("blank name should be rejected");
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn rule_delete_enforces_ownership() {
        let ops = ops();
        let ada = seed_author(&ops, "ada").await;
        let alan = seed_author(&ops, "alan").await;
        let rule = ops
            .rule_create(ada.id, new_rule("No pushing to main"))
            .await
            .expect("rule should be created");

        let denied = ops
            .rule_delete(alan.id, rule.id)
            .await
            .expect("foreign delete should report nothing");
        assert_eq!(denied, None);

        let removed = ops
            .rule_delete(ada.id, rule.id)
            .await
            .expect("owner delete should succeed");
        assert_eq!(removed, Some(rule.id));

        let page = ops
            .user_rules(ada.id, PageArgs::default())
            .await
            .expect("rules should page");
        assert!(page.rows.is_empty());
    }

    #[tokio::test]
    async fn rule_delete_drops_like_edges() {
        let ops = ops();
        let ada = seed_author(&ops, "ada").await;
        let alan = seed_author(&ops, "alan").await;
        let kept = ops
            .rule_create(ada.id, new_rule("kept"))
            .await
            .expect("rule should be created");
        let doomed = ops
            .rule_create(ada.id, new_rule("doomed"))
            .await
            .expect("rule should be created");
        ops.likes_update(alan.id, vec![kept.id, doomed.id], Vec::new())
            .await
            .expect("likes should apply");

        let removed = ops
            .rule_delete(ada.id, doomed.id)
            .await
            .expect("owner delete should succeed");
        assert_eq!(removed, Some(doomed.id));

        let liked = ops
            .user_likes(alan.id, PageArgs::default())
            .await
            .expect("liked rules should page after the delete");
        let ids: Vec<RuleId> = liked.rows.iter().map(|rule| rule.id).collect();
        assert_eq!(ids, vec![kept.id]);

        let likers = ops
            .rule_likers(doomed.id, PageArgs::default())
            .await
            .expect("likers of a deleted rule should page");
        assert!(likers.rows.is_empty());
    }

    #[tokio::test]
    async fn rule_author_walks_back_to_the_user() {
        let ops = ops();
        let ada = seed_author(&ops, "ada").await;
        let rule = ops
            .rule_create(ada.id, new_rule("Review before merge"))
            .await
            .expect("rule should be created");

        let author = ops
            .rule_author(rule.id)
            .await
            .expect("author should resolve");
        assert_eq!(author.id, ada.id);

        let missing = ops
            .rule_author(RuleId(404))
            .await
            .expect_err("unknown rule should fail");
        assert_eq!(missing.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn users_page_honors_name_patterns() {
        let ops = ops();
        let ada = seed_author(&ops, "Ada").await;
        let alan = seed_author(&ops, "Alan").await;
        seed_author(&ops, "Grace").await;

        let page = ops
            .users(PageArgs { limit: 10, after: 0 }, Some("A%".to_string()))
            .await
            .expect("users should page");
        let ids: Vec<UserId> = page.rows.iter().map(|user| user.id).collect();
        assert_eq!(ids, vec![ada.id, alan.id]);
        assert!(!page.info.has_next_page);
    }

    #[tokio::test]
    async fn user_rules_reports_boundary_info() {
        let ops = ops();
        let ada = seed_author(&ops, "ada").await;
        for summary in ["first", "second", "third"] {
            ops.rule_create(ada.id, new_rule(summary))
                .await
                .expect("rule should be created");
        }

        let page = ops
            .user_rules(ada.id, PageArgs { limit: 2, after: 0 })
            .await
            .expect("rules should page");
        assert_eq!(page.rows.len(), 2);
        assert!(!page.info.has_previous_page);
        assert!(page.info.has_next_page);
    }

    #[tokio::test]
    async fn likes_flow_pages_hydrated_rows() {
        let ops = ops();
        let ada = seed_author(&ops, "ada").await;
        let alan = seed_author(&ops, "alan").await;
        let mut rules = Vec::new();
        for summary in ["first", "second", "third"] {
            rules.push(
                ops.rule_create(ada.id, new_rule(summary))
                    .await
                    .expect("rule should be created"),
            );
        }

        let update = ops
            .likes_update(
                alan.id,
                rules.iter().map(|rule| rule.id).collect(),
                Vec::new(),
            )
            .await
            .expect("likes should apply");
        assert_eq!(update.added.len(), 3);
        assert!(update.removed.is_empty());

        let liked = ops
            .user_likes(alan.id, PageArgs { limit: 2, after: 0 })
            .await
            .expect("liked rules should page");
        let summaries: Vec<&str> = liked
            .rows
            .iter()
            .map(|rule| rule.summary.as_str())
            .collect();
        assert_eq!(summaries, vec!["first", "second"]);
        assert!(liked.info.has_next_page);
        assert_eq!(liked.info.end_cursor, Some(rules[1].id.0));

        let likers = ops
            .rule_likers(rules[0].id, PageArgs::default())
            .await
            .expect("likers should page");
        let names: Vec<&str> = likers.rows.iter().map(|user| user.name.as_str()).collect();
        assert_eq!(names, vec!["alan"]);
    }

    #[tokio::test]
    async fn execute_rejects_anonymous_mutations() {
        let ops = ops();
        let err = ops
            .execute(
                None,
                RulebookOperation::LikesUpdate {
                    add: vec![RuleId(1)],
                    remove: Vec::new(),
                },
            )
            .await
            .expect_err("anonymous likes update should fail");
        assert_eq!(err.kind, ErrorKind::Forbidden);
        assert_eq!(err.code, "unauthenticated");
    }

    #[tokio::test]
    async fn execute_dispatches_tagged_operations() {
        let ops = ops();
        let ada = seed_author(&ops, "ada").await;

        let operation: RulebookOperation = serde_json::from_value(json!({
            "operation": "rule_create",
            "rule": {"summary": "Keep CI green", "detail": "Red builds block releases"},
        }))
        .expect("operation should deserialize");
        let result = ops
            .execute(Some(ada.id), operation)
            .await
            .expect("rule create should dispatch");

        let encoded = serde_json::to_value(&result).expect("result should serialize");
        assert_eq!(encoded["result"], "rule");
        assert_eq!(encoded["rule"]["summary"], "Keep CI green");
        assert_eq!(encoded["rule"]["userId"], ada.id.0);
    }
}
