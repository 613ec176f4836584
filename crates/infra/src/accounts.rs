//! User and membership records, plus the datastore-backed pieces of the
//! authorization boundary: [`StoreDirectory`] and [`ActorResolver`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use civitas_auth::{
    Actor, AuthzError, Directory, ResourceOwner, Role, SessionClaims, TrustTier, UserActor, validate_claims,
};
use civitas_core::{AggregateRef, CommunityId, UserId};

use crate::datastore::{DataStore, StoreError, StoreResult, Table, Transaction};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: UserId,
    pub address: String,
    pub tier: TrustTier,
    pub is_super_admin: bool,
    pub banned: bool,
    pub referred_by: Option<UserId>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub user_id: UserId,
    pub community_id: CommunityId,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

pub const USERS: Table<UserRecord> = Table::new("users");
/// Keyed `<user>/<community>`, scanned when resolving an actor.
pub const MEMBERSHIPS: Table<MembershipRecord> = Table::new("memberships");
/// Same rows keyed `<community>/<user>`, scanned when listing members.
pub const COMMUNITY_MEMBERS: Table<MembershipRecord> = Table::new("community_members");

pub fn membership_key(user_id: UserId, community_id: CommunityId) -> String {
    format!("{user_id}/{community_id}")
}

pub fn member_index_key(community_id: CommunityId, user_id: UserId) -> String {
    format!("{community_id}/{user_id}")
}

/// Insert a membership and its community index row. `false` if already a member.
pub fn add_membership(tx: &mut dyn Transaction, membership: &MembershipRecord) -> StoreResult<bool> {
    let key = membership_key(membership.user_id, membership.community_id);
    if !MEMBERSHIPS.insert(tx, &key, membership)? {
        return Ok(false);
    }
    COMMUNITY_MEMBERS.put(
        tx,
        &member_index_key(membership.community_id, membership.user_id),
        membership,
    )?;
    Ok(true)
}

type OwnerLookup = Box<dyn Fn(&dyn DataStore, &str) -> StoreResult<Option<ResourceOwner>> + Send + Sync>;

/// [`Directory`] over the datastore.
///
/// Ownership rules are registered per aggregate kind by the domain that owns
/// the table.
pub struct StoreDirectory {
    store: Arc<dyn DataStore>,
    owners: HashMap<String, OwnerLookup>,
}

impl StoreDirectory {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self {
            store,
            owners: HashMap::new(),
        }
    }

    /// Resolve owners of `kind` resources by reading `table` at the resource id.
    pub fn with_owner<T>(mut self, kind: &'static str, table: Table<T>, owner: fn(&T) -> ResourceOwner) -> Self
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        self.owners.insert(
            kind.to_string(),
            Box::new(move |store, id| Ok(table.read(store, id)?.map(|row| owner(&row)))),
        );
        self
    }
}

fn unavailable(err: StoreError) -> AuthzError {
    AuthzError::Directory(err.to_string())
}

impl Directory for StoreDirectory {
    fn resource_owner(&self, resource: &AggregateRef) -> Result<Option<ResourceOwner>, AuthzError> {
        let lookup = self
            .owners
            .get(&resource.kind)
            .ok_or_else(|| AuthzError::Forbidden(format!("no ownership rule for {}", resource.kind)))?;
        lookup(self.store.as_ref(), &resource.id).map_err(unavailable)
    }

    fn persist_tier(&self, user_id: UserId, tier: TrustTier) -> Result<(), AuthzError> {
        let mut tx = self.store.begin().map_err(unavailable)?;
        let key = user_id.to_string();
        let Some(mut user) = USERS.get(&mut *tx, &key).map_err(unavailable)? else {
            tx.rollback().map_err(unavailable)?;
            return Err(AuthzError::InvalidActor("unknown user".into()));
        };
        if tier <= user.tier {
            // A concurrent call already raised it.
            tx.rollback().map_err(unavailable)?;
            return Ok(());
        }

        user.tier = tier;
        USERS.put(&mut *tx, &key, &user).map_err(unavailable)?;
        tx.commit().map_err(unavailable)?;
        Ok(())
    }
}

/// Turns verified session claims into an [`Actor`].
pub struct ActorResolver {
    store: Arc<dyn DataStore>,
}

impl ActorResolver {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    pub fn resolve(&self, claims: &SessionClaims, now: DateTime<Utc>) -> Result<Actor, AuthzError> {
        validate_claims(claims, now).map_err(|err| {
            debug!(user_id = %claims.sub, error = %err, "rejected session claims");
            AuthzError::Unauthenticated
        })?;

        let actor = self.load(claims.sub)?;
        if !actor.address.eq_ignore_ascii_case(&claims.address) {
            return Err(AuthzError::InvalidActor("address does not belong to user".into()));
        }
        Ok(Actor::User(actor))
    }

    /// Load a user with its memberships, refusing banned users.
    pub fn load(&self, user_id: UserId) -> Result<UserActor, AuthzError> {
        let store = self.store.as_ref();
        let user = USERS
            .read(store, &user_id.to_string())
            .map_err(unavailable)?
            .ok_or_else(|| AuthzError::InvalidActor("unknown user".into()))?;
        if user.banned || user.tier == TrustTier::Banned {
            return Err(AuthzError::InvalidActor("banned actor".into()));
        }

        let memberships = MEMBERSHIPS
            .read_scan(store, &format!("{user_id}/"))
            .map_err(unavailable)?
            .into_iter()
            .map(|(_, m)| (m.community_id, m.role))
            .collect();

        Ok(UserActor {
            user_id: user.user_id,
            address: user.address,
            is_super_admin: user.is_super_admin,
            tier: user.tier,
            registered_at: user.registered_at,
            memberships,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::datastore::InMemoryDataStore;

    fn seed_user(store: &InMemoryDataStore, tier: TrustTier, banned: bool) -> UserRecord {
        let user = UserRecord {
            user_id: UserId::new(),
            address: "0xAbC".into(),
            tier,
            is_super_admin: false,
            banned,
            referred_by: None,
            registered_at: Utc::now() - Duration::days(1),
        };
        let mut tx = store.begin().unwrap();
        USERS.put(&mut *tx, &user.user_id.to_string(), &user).unwrap();
        tx.commit().unwrap();
        user
    }

    fn claims(user: &UserRecord, address: &str) -> SessionClaims {
        let now = Utc::now();
        SessionClaims {
            sub: user.user_id,
            address: address.into(),
            issued_at: now - Duration::minutes(1),
            expires_at: now + Duration::hours(1),
        }
    }

    #[test]
    fn resolves_user_with_memberships() {
        let store = InMemoryDataStore::new();
        let user = seed_user(&store, TrustTier::VerifiedWallet, false);
        let community_id = CommunityId::new();
        let mut tx = store.begin().unwrap();
        let membership = MembershipRecord {
            user_id: user.user_id,
            community_id,
            role: Role::Moderator,
            joined_at: Utc::now(),
        };
        assert!(add_membership(&mut *tx, &membership).unwrap());
        assert!(!add_membership(&mut *tx, &membership).unwrap());
        tx.commit().unwrap();

        let resolver = ActorResolver::new(Arc::new(store));
        let actor = resolver.resolve(&claims(&user, "0xabc"), Utc::now()).unwrap();
        let user_actor = actor.as_user().unwrap();
        assert_eq!(user_actor.role_in(community_id), Some(Role::Moderator));
    }

    #[test]
    fn expired_claims_are_unauthenticated() {
        let store = InMemoryDataStore::new();
        let user = seed_user(&store, TrustTier::VerifiedWallet, false);
        let resolver = ActorResolver::new(Arc::new(store));

        let later = Utc::now() + Duration::hours(2);
        assert_eq!(
            resolver.resolve(&claims(&user, "0xabc"), later),
            Err(AuthzError::Unauthenticated)
        );
    }

    #[test]
    fn banned_users_and_foreign_addresses_are_invalid_actors() {
        let store = InMemoryDataStore::new();
        let banned = seed_user(&store, TrustTier::VerifiedWallet, true);
        let other = seed_user(&store, TrustTier::VerifiedWallet, false);
        let resolver = ActorResolver::new(Arc::new(store));

        assert_eq!(
            resolver.resolve(&claims(&banned, "0xabc"), Utc::now()),
            Err(AuthzError::InvalidActor("banned actor".into()))
        );
        assert!(matches!(
            resolver.resolve(&claims(&other, "0xdef"), Utc::now()),
            Err(AuthzError::InvalidActor(_))
        ));
    }

    #[test]
    fn persist_tier_only_raises() {
        let store = Arc::new(InMemoryDataStore::new());
        let user = seed_user(&store, TrustTier::SocialVerified, false);
        let directory = StoreDirectory::new(store.clone());

        directory.persist_tier(user.user_id, TrustTier::VerifiedWallet).unwrap();
        let key = user.user_id.to_string();
        assert_eq!(USERS.read(store.as_ref(), &key).unwrap().unwrap().tier, TrustTier::SocialVerified);

        directory.persist_tier(user.user_id, TrustTier::ChainVerified).unwrap();
        assert_eq!(USERS.read(store.as_ref(), &key).unwrap().unwrap().tier, TrustTier::ChainVerified);
    }

    #[test]
    fn persist_tier_rejects_unknown_users_without_writing() {
        let store = Arc::new(InMemoryDataStore::new());
        let directory = StoreDirectory::new(store.clone());

        assert_eq!(
            directory.persist_tier(UserId::new(), TrustTier::VerifiedWallet),
            Err(AuthzError::InvalidActor("unknown user".into()))
        );
        assert_eq!(store.count_all().unwrap(), 0);
    }

    #[test]
    fn owner_lookup_uses_registered_rule() {
        let store = Arc::new(InMemoryDataStore::new());
        let user = seed_user(&store, TrustTier::VerifiedWallet, false);
        let directory = StoreDirectory::new(store.clone()).with_owner("user", USERS, |u| ResourceOwner::new(u.user_id));

        assert_eq!(
            directory.resource_owner(&AggregateRef::user(user.user_id)).unwrap(),
            Some(ResourceOwner::new(user.user_id))
        );
        assert_eq!(directory.resource_owner(&AggregateRef::user(UserId::new())).unwrap(), None);
        assert!(matches!(
            directory.resource_owner(&AggregateRef::new("thread", "x")),
            Err(AuthzError::Forbidden(_))
        ));
    }
}
