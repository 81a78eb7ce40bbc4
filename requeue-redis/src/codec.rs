//! Mapping between the job hash and the typed [`Job`] snapshot.
//!
//! Instants are persisted as integer nanoseconds since the epoch; `0`
//! means unset (and, for `freq`, one-off). Empty strings stand for absent
//! `error` and `pool_id`.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use requeue::{
    backend::{BackendError, NewJob},
    job::{Job, JobId, JobStatus},
    pool::PoolId,
};

pub(crate) fn to_ns(instant: DateTime<Utc>) -> i64 {
    // Instants past the year 2262 saturate.
    instant.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

pub(crate) fn from_ns(ns: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(ns)
}

/// The full field set written when a job is created.
pub(crate) fn hash_fields(id: &JobId, job: &NewJob) -> Vec<(&'static str, Vec<u8>)> {
    let freq_ns = job
        .freq
        .and_then(|freq| freq.num_nanoseconds())
        .unwrap_or(0);
    vec![
        ("id", id.as_str().as_bytes().to_vec()),
        ("type", job.type_name.clone().into_bytes()),
        ("payload", job.payload.clone()),
        ("priority", job.priority.to_string().into_bytes()),
        ("time", to_ns(job.time).to_string().into_bytes()),
        ("freq", freq_ns.to_string().into_bytes()),
        ("retries", job.retries.to_string().into_bytes()),
        ("status", JobStatus::Queued.as_str().as_bytes().to_vec()),
        ("started", b"0".to_vec()),
        ("finished", b"0".to_vec()),
        ("error", Vec::new()),
        ("pool_id", Vec::new()),
    ]
}

pub(crate) fn job_from_hash(mut map: HashMap<String, Vec<u8>>) -> Result<Job, BackendError> {
    let id = JobId::from(utf8_field(&mut map, "id")?);
    let type_name = utf8_field(&mut map, "type")?;
    let payload = map
        .remove("payload")
        .ok_or_else(|| missing_field("payload"))?;
    let priority = int_field(&mut map, "priority")?;
    let time = from_ns(int_field(&mut map, "time")?);
    let freq = match int_field(&mut map, "freq")? {
        0 => None,
        ns => Some(TimeDelta::nanoseconds(ns)),
    };
    let retries = u32::try_from(int_field(&mut map, "retries")?)
        .map_err(|_| BackendError::Decode("negative retries".to_owned()))?;
    let status_name = utf8_field(&mut map, "status")?;
    let status = JobStatus::parse(&status_name)
        .ok_or_else(|| BackendError::Decode(format!("unknown status {status_name:?}")))?;
    let started = optional_instant(&mut map, "started")?;
    let finished = optional_instant(&mut map, "finished")?;
    let error = match utf8_field(&mut map, "error")? {
        error if error.is_empty() => None,
        error => Some(error),
    };
    let pool_id = match utf8_field(&mut map, "pool_id")? {
        pool_id if pool_id.is_empty() => None,
        pool_id => Some(PoolId::from(pool_id)),
    };

    Ok(Job {
        id,
        type_name,
        payload,
        priority,
        time,
        freq,
        retries,
        status,
        started,
        finished,
        error,
        pool_id,
    })
}

fn missing_field(field: &str) -> BackendError {
    BackendError::Decode(format!("missing field {field:?}"))
}

fn utf8_field(map: &mut HashMap<String, Vec<u8>>, field: &str) -> Result<String, BackendError> {
    let raw = map.remove(field).ok_or_else(|| missing_field(field))?;
    String::from_utf8(raw)
        .map_err(|_| BackendError::Decode(format!("field {field:?} is not UTF-8")))
}

fn int_field(map: &mut HashMap<String, Vec<u8>>, field: &str) -> Result<i64, BackendError> {
    utf8_field(map, field)?
        .parse()
        .map_err(|_| BackendError::Decode(format!("field {field:?} is not an integer")))
}

fn optional_instant(
    map: &mut HashMap<String, Vec<u8>>,
    field: &str,
) -> Result<Option<DateTime<Utc>>, BackendError> {
    Ok(match int_field(map, field)? {
        0 => None,
        ns => Some(from_ns(ns)),
    })
}
