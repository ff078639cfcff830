use super::batch::fetch_rows;
use super::SharedBackend;
use crate::config::ShardingConfig;
use crate::error::{ForumError, ForumResult};
use crate::model::{EntityId, NaturalKeyKind, User};
use crate::pool::WorkerPool;
use crate::shard::ShardedTable;
use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)+$").expect("email pattern")
});

static PHONE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^1[3-9][0-9]{9}$").expect("phone pattern"));

/// Which natural key a login name is, if it is either an email or a phone.
pub fn classify_username(username: &str) -> Option<NaturalKeyKind> {
    if EMAIL_PATTERN.is_match(username) {
        Some(NaturalKeyKind::Email)
    } else if PHONE_PATTERN.is_match(username) {
        Some(NaturalKeyKind::Phone)
    } else {
        None
    }
}

/// Users sharded by id, plus one sharded index per natural key.
pub struct UserStore {
    backend: SharedBackend,
    users: ShardedTable,
    emails: ShardedTable,
    phones: ShardedTable,
    nicknames: ShardedTable,
    pool: WorkerPool,
}

impl UserStore {
    pub fn new(backend: SharedBackend, sharding: &ShardingConfig, pool: WorkerPool) -> Self {
        Self {
            backend,
            users: sharding.users(),
            emails: sharding.user_emails(),
            phones: sharding.user_phones(),
            nicknames: sharding.user_nicknames(),
            pool,
        }
    }

    fn index(&self, kind: NaturalKeyKind) -> &ShardedTable {
        match kind {
            NaturalKeyKind::Email => &self.emails,
            NaturalKeyKind::Phone => &self.phones,
            NaturalKeyKind::Nickname => &self.nicknames,
        }
    }

    /// Claims every natural key, then writes the primary row.
    ///
    /// A taken key yields [`ForumError::Duplicate`]. On any failure the keys
    /// already claimed by this call are released again, so a failed create
    /// leaves no index entry pointing at a missing user.
    #[instrument(skip_all, fields(user_id = %user.user_id))]
    pub fn create(&self, user: &User) -> ForumResult<()> {
        let row = serde_json::to_vec(user).context("fail to encode user")?;
        let mut claimed: Vec<(String, Vec<u8>)> = Vec::new();

        for (kind, key) in user.natural_keys() {
            let table = self.index(kind).table_for_key(key);
            match self
                .backend
                .insert_unique(&table, key.as_bytes(), &user.user_id.to_be_bytes())
            {
                Ok(true) => claimed.push((table, key.as_bytes().to_vec())),
                Ok(false) => {
                    debug!(%kind, "natural key already taken");
                    self.release(&claimed);
                    return Err(ForumError::Duplicate(kind));
                }
                Err(err) => {
                    self.release(&claimed);
                    return Err(err
                        .context(format!("fail to claim {kind} in {table}"))
                        .into());
                }
            }
        }

        let table = self.users.table_for_id(user.user_id);
        match self
            .backend
            .insert_unique(&table, &user.user_id.to_be_bytes(), &row)
        {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.release(&claimed);
                Err(ForumError::InvalidArgument(format!(
                    "user id {} already exists",
                    user.user_id
                )))
            }
            Err(err) => {
                self.release(&claimed);
                Err(err.context(format!("fail to insert user into {table}")).into())
            }
        }
    }

    fn release(&self, claimed: &[(String, Vec<u8>)]) {
        for (table, key) in claimed.iter().rev() {
            if let Err(err) = self.backend.delete(table, key) {
                warn!(%table, error = %err, "fail to release natural key");
            }
        }
    }

    pub fn fetch_by_id(&self, user_id: EntityId) -> ForumResult<Option<User>> {
        let table = self.users.table_for_id(user_id);
        let Some(row) = self.backend.get(&table, &user_id.to_be_bytes())? else {
            return Ok(None);
        };
        let user = serde_json::from_slice(&row)
            .with_context(|| format!("corrupt user {user_id} in {table}"))?;
        Ok(Some(user))
    }

    pub fn exists(&self, user_id: EntityId) -> ForumResult<bool> {
        let table = self.users.table_for_id(user_id);
        Ok(self.backend.contains(&table, &user_id.to_be_bytes())?)
    }

    /// Positionally aligned with `ids`; see [`fetch_rows`].
    pub async fn batch_fetch(
        &self,
        ids: &[EntityId],
        cancel: &CancellationToken,
    ) -> ForumResult<Vec<Option<User>>> {
        fetch_rows(&self.backend, &self.users, &self.pool, ids, cancel).await
    }

    pub fn lookup(&self, kind: NaturalKeyKind, key: &str) -> ForumResult<Option<EntityId>> {
        let table = self.index(kind).table_for_key(key);
        let Some(raw) = self.backend.get(&table, key.as_bytes())? else {
            return Ok(None);
        };
        let id = EntityId::from_be_slice(&raw)
            .with_context(|| format!("corrupt {kind} index entry in {table}"))?;
        Ok(Some(id))
    }

    pub fn email_to_id(&self, email: &str) -> ForumResult<Option<EntityId>> {
        self.lookup(NaturalKeyKind::Email, email)
    }

    pub fn phone_to_id(&self, phone: &str) -> ForumResult<Option<EntityId>> {
        self.lookup(NaturalKeyKind::Phone, phone)
    }

    pub fn nickname_to_id(&self, nickname: &str) -> ForumResult<Option<EntityId>> {
        self.lookup(NaturalKeyKind::Nickname, nickname)
    }

    /// Resolves a login name that is either an email or a phone number.
    pub fn username_to_id(&self, username: &str) -> ForumResult<Option<EntityId>> {
        match classify_username(username) {
            Some(kind) => self.lookup(kind, username),
            None => Err(ForumError::InvalidArgument(format!(
                "{username:?} is neither an email nor a phone number"
            ))),
        }
    }
}
