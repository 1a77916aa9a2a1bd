// src/keys.rs

use crate::member::MemberStatus;

/// Pure mapping from a member id to the Redis keys representing it.
///
/// One hash per member plus five status-membership sets. The resolver holds
/// the configured prefix and nothing else; no state, no I/O.
#[derive(Debug, Clone)]
pub struct KeyResolver {
    prefix: String,
}

impl KeyResolver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Hash record for one member: `{prefix}pool:{id}`.
    pub fn member_key(&self, id: i64) -> String {
        format!("{}pool:{}", self.prefix, id)
    }

    /// Prefix shared by all member hashes, passed to scripts that build the
    /// hash key server-side.
    pub fn member_key_prefix(&self) -> String {
        format!("{}pool:", self.prefix)
    }

    pub fn idle_set_key(&self) -> String {
        format!("{}idle", self.prefix)
    }

    pub fn borrowed_set_key(&self) -> String {
        format!("{}borrowed", self.prefix)
    }

    pub fn cooldown_set_key(&self) -> String {
        format!("{}cooldown", self.prefix)
    }

    pub fn session_required_set_key(&self) -> String {
        format!("{}session_required", self.prefix)
    }

    pub fn suspended_set_key(&self) -> String {
        format!("{}suspended", self.prefix)
    }

    /// Legacy alias kept to avoid a breaking rename: the old `ready` set is
    /// the same key as `idle`.
    pub fn ready_set_key(&self) -> String {
        self.idle_set_key()
    }

    /// Membership set for a status.
    pub fn status_set_key(&self, status: MemberStatus) -> String {
        match status {
            MemberStatus::Idle => self.idle_set_key(),
            MemberStatus::Borrowed => self.borrowed_set_key(),
            MemberStatus::Cooldown => self.cooldown_set_key(),
            MemberStatus::SessionRequired => self.session_required_set_key(),
            MemberStatus::Suspended => self.suspended_set_key(),
        }
    }

    /// All five membership sets, used by stats and clear operations.
    pub fn all_status_set_keys(&self) -> [String; 5] {
        [
            self.idle_set_key(),
            self.borrowed_set_key(),
            self.cooldown_set_key(),
            self.session_required_set_key(),
            self.suspended_set_key(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_member_and_set_keys() {
        let resolver = KeyResolver::new("useragent:");
        assert_eq!(resolver.member_key(42), "useragent:pool:42");
        assert_eq!(resolver.member_key_prefix(), "useragent:pool:");
        assert_eq!(resolver.idle_set_key(), "useragent:idle");
        assert_eq!(resolver.borrowed_set_key(), "useragent:borrowed");
        assert_eq!(resolver.cooldown_set_key(), "useragent:cooldown");
        assert_eq!(
            resolver.session_required_set_key(),
            "useragent:session_required"
        );
        assert_eq!(resolver.suspended_set_key(), "useragent:suspended");
    }

    #[test]
    fn ready_alias_points_at_idle() {
        let resolver = KeyResolver::new("p:");
        assert_eq!(resolver.ready_set_key(), resolver.idle_set_key());
    }

    #[test]
    fn status_set_key_covers_every_status() {
        let resolver = KeyResolver::new("p:");
        assert_eq!(resolver.status_set_key(MemberStatus::Idle), "p:idle");
        assert_eq!(
            resolver.status_set_key(MemberStatus::Borrowed),
            "p:borrowed"
        );
        assert_eq!(
            resolver.status_set_key(MemberStatus::Cooldown),
            "p:cooldown"
        );
        assert_eq!(
            resolver.status_set_key(MemberStatus::SessionRequired),
            "p:session_required"
        );
        assert_eq!(
            resolver.status_set_key(MemberStatus::Suspended),
            "p:suspended"
        );
    }
}
