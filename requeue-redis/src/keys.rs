//! The persisted key layout. Stable and compatibility-relevant:
//!
//! - `<ns>:jobs:<id>`: hash of job attributes
//! - `<ns>:jobs:status:<S>`: sorted set, scored by `-priority`
//! - `<ns>:jobs:time`: sorted set, scored by eligible time (ns)
//! - `<ns>:jobs:type:<name>`: set of ids
//! - `<ns>:jobs:executing:<pool_id>`: set of ids owned by one pool
//! - `<ns>:pools:<pool_id>:heartbeat`: integer string (ns)

use std::fmt::Display;

use redis::ToRedisArgs;
use requeue::{
    job::{JobId, JobStatus},
    pool::PoolId,
};

/// Prefix applied to every key so several deployments can share one
/// database.
#[derive(Debug, Clone)]
pub(crate) struct Namespace(String);

impl Namespace {
    pub(crate) fn new(prefix: impl Into<String>) -> Self {
        Self(prefix.into())
    }

    pub(crate) fn prefix(&self) -> &str {
        &self.0
    }

    pub(crate) fn job<'a>(&'a self, id: &'a JobId) -> Key<'a> {
        self.key(KeyKind::Job(id))
    }

    pub(crate) fn status(&self, status: JobStatus) -> Key<'_> {
        self.key(KeyKind::Status(status))
    }

    pub(crate) fn time(&self) -> Key<'_> {
        self.key(KeyKind::Time)
    }

    pub(crate) fn job_type<'a>(&'a self, name: &'a str) -> Key<'a> {
        self.key(KeyKind::Type(name))
    }

    pub(crate) fn heartbeat<'a>(&'a self, pool_id: &'a PoolId) -> Key<'a> {
        self.key(KeyKind::Heartbeat(pool_id))
    }

    pub(crate) fn heartbeat_pattern(&self) -> String {
        format!("{}:pools:*:heartbeat", self.0)
    }

    /// Inverse of the heartbeat key format, for SCAN results.
    pub(crate) fn pool_of_heartbeat_key(&self, key: &str) -> Option<PoolId> {
        key.strip_prefix(&self.0)?
            .strip_prefix(":pools:")?
            .strip_suffix(":heartbeat")
            .map(|pool_id| PoolId::from(pool_id.to_owned()))
    }

    fn key<'a>(&'a self, kind: KeyKind<'a>) -> Key<'a> {
        Key {
            namespace: &self.0,
            kind,
        }
    }
}

pub(crate) struct Key<'a> {
    namespace: &'a str,
    kind: KeyKind<'a>,
}

enum KeyKind<'a> {
    Job(&'a JobId),
    Status(JobStatus),
    Time,
    Type(&'a str),
    Heartbeat(&'a PoolId),
}

impl Display for Key<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.namespace)?;
        match &self.kind {
            KeyKind::Job(id) => write!(f, ":jobs:{id}"),
            KeyKind::Status(status) => write!(f, ":jobs:status:{status}"),
            KeyKind::Time => write!(f, ":jobs:time"),
            KeyKind::Type(name) => write!(f, ":jobs:type:{name}"),
            KeyKind::Heartbeat(pool_id) => write!(f, ":pools:{pool_id}:heartbeat"),
        }
    }
}

impl ToRedisArgs for Key<'_> {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + redis::RedisWrite,
    {
        out.write_arg_fmt(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_the_persisted_layout() {
        let ns = Namespace::new("requeue");
        let id = JobId::from("abc");
        let pool_id = PoolId::from("p1".to_owned());

        assert_eq!(ns.job(&id).to_string(), "requeue:jobs:abc");
        assert_eq!(
            ns.status(JobStatus::Queued).to_string(),
            "requeue:jobs:status:queued"
        );
        assert_eq!(ns.time().to_string(), "requeue:jobs:time");
        assert_eq!(ns.job_type("greet").to_string(), "requeue:jobs:type:greet");
        assert_eq!(
            ns.heartbeat(&pool_id).to_string(),
            "requeue:pools:p1:heartbeat"
        );
        assert_eq!(ns.heartbeat_pattern(), "requeue:pools:*:heartbeat");
    }

    #[test]
    fn heartbeat_keys_parse_back_to_pool_ids() {
        let ns = Namespace::new("requeue");
        assert_eq!(
            ns.pool_of_heartbeat_key("requeue:pools:p1:heartbeat"),
            Some(PoolId::from("p1".to_owned()))
        );
        assert_eq!(ns.pool_of_heartbeat_key("other:pools:p1:heartbeat"), None);
        assert_eq!(ns.pool_of_heartbeat_key("requeue:jobs:abc"), None);
    }
}
