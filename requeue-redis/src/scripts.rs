//! Server-side atomic operations.
//!
//! Every multi-step state transition lives here as a Lua script the store
//! evaluates without interleaving other commands; the client never
//! replicates these transitions locally. Scripts take the key-namespace
//! prefix as their first argument and derive every key from it, and they
//! read "now" from the store's own clock.
//!
//! Nanosecond instants exceed the 53-bit integer range of Lua numbers, so
//! they are written back with `%.0f` rather than relying on the default
//! number-to-string conversion (which would produce scientific notation).

use redis::Script;

/// Shared Lua helpers prepended to the scripts that need them.
const HELPERS: &str = r#"
local function now_ns()
  local clock = redis.call('TIME')
  return clock[1] * 1000000000 + clock[2] * 1000
end

local function fmt_ns(value)
  return string.format('%.0f', value)
end

-- The shared tail of a failed execution: back to queued while retry budget
-- remains (eligible time untouched), otherwise permanently failed.
local function fail_or_requeue(prefix, id, err, force)
  local job_key = prefix .. ':jobs:' .. id
  local status = redis.call('HGET', job_key, 'status')
  if not status then return '' end
  if status ~= 'executing' then return status end
  local executing_key = prefix .. ':jobs:status:executing'
  local score = redis.call('ZSCORE', executing_key, id)
  if not score then score = 0 end
  local pool_id = redis.call('HGET', job_key, 'pool_id')
  redis.call('ZREM', executing_key, id)
  if pool_id and pool_id ~= '' then
    redis.call('SREM', prefix .. ':jobs:executing:' .. pool_id, id)
  end
  local retries = tonumber(redis.call('HGET', job_key, 'retries')) or 0
  if force or retries <= 0 then
    redis.call('ZADD', prefix .. ':jobs:status:failed', score, id)
    redis.call('HSET', job_key, 'status', 'failed', 'error', err,
               'finished', fmt_ns(now_ns()), 'pool_id', '')
    return 'failed'
  end
  redis.call('HSET', job_key, 'retries', retries - 1, 'status', 'queued',
             'pool_id', '', 'started', 0)
  redis.call('ZADD', prefix .. ':jobs:status:queued', score, id)
  return 'queued'
end
"#;

/// ARGV: prefix, batch size, pool id.
///
/// Walks the queued set in score order (highest priority first, ties by
/// ascending id), filters by eligible time against the store clock, and
/// claims up to batch-size jobs for the calling pool. Returns
/// `{id, type, payload}` triples; fewer than asked when fewer are ready.
const POP_NEXT_JOBS: &str = r#"
local prefix = ARGV[1]
local batch = tonumber(ARGV[2])
local pool_id = ARGV[3]
local queued_key = prefix .. ':jobs:status:queued'
local time_key = prefix .. ':jobs:time'
local now = now_ns()

local picked = {}
local offset = 0
while #picked < batch do
  local page = redis.call('ZRANGE', queued_key, offset, offset + 99)
  if #page == 0 then break end
  for _, id in ipairs(page) do
    if #picked < batch then
      local ready_at = redis.call('ZSCORE', time_key, id)
      if ready_at and tonumber(ready_at) <= now then
        picked[#picked + 1] = id
      end
    end
  end
  offset = offset + 100
end

local executing_key = prefix .. ':jobs:status:executing'
local pool_key = prefix .. ':jobs:executing:' .. pool_id
local reply = {}
for i, id in ipairs(picked) do
  local job_key = prefix .. ':jobs:' .. id
  local score = redis.call('ZSCORE', queued_key, id)
  redis.call('ZREM', queued_key, id)
  redis.call('ZADD', executing_key, score, id)
  redis.call('SADD', pool_key, id)
  redis.call('HSET', job_key, 'status', 'executing', 'pool_id', pool_id,
             'started', fmt_ns(now))
  reply[i] = {id, redis.call('HGET', job_key, 'type'),
              redis.call('HGET', job_key, 'payload')}
end
return reply
"#;

/// ARGV: prefix, id, error message, force ('1' skips the retry budget).
///
/// Returns the resulting status, the current status when the job is not
/// executing (no-op), or '' when the job does not exist.
const RETRY_OR_FAIL: &str = r#"
return fail_or_requeue(ARGV[1], ARGV[2], ARGV[3], ARGV[4] == '1')
"#;

/// ARGV: prefix, id.
///
/// One-off jobs become finished. Recurring jobs go back to queued with
/// their eligible time advanced to max(time + freq, now + freq), which is
/// strictly greater than now and advances exactly once per call.
const MARK_FINISHED: &str = r#"
local prefix = ARGV[1]
local id = ARGV[2]
local job_key = prefix .. ':jobs:' .. id
local status = redis.call('HGET', job_key, 'status')
if not status then return '' end
if status ~= 'executing' then return status end

local executing_key = prefix .. ':jobs:status:executing'
local score = redis.call('ZSCORE', executing_key, id)
if not score then score = 0 end
local pool_id = redis.call('HGET', job_key, 'pool_id')
redis.call('ZREM', executing_key, id)
if pool_id and pool_id ~= '' then
  redis.call('SREM', prefix .. ':jobs:executing:' .. pool_id, id)
end

local now = now_ns()
local freq = tonumber(redis.call('HGET', job_key, 'freq')) or 0
if freq > 0 then
  local eligible = tonumber(redis.call('HGET', job_key, 'time')) or 0
  local next_time = eligible + freq
  local floor = now + freq
  if next_time < floor then next_time = floor end
  redis.call('ZADD', prefix .. ':jobs:time', next_time, id)
  redis.call('ZADD', prefix .. ':jobs:status:queued', score, id)
  redis.call('HSET', job_key, 'status', 'queued', 'time', fmt_ns(next_time),
             'pool_id', '', 'started', 0, 'finished', 0, 'error', '')
  return 'queued'
end
redis.call('ZADD', prefix .. ':jobs:status:finished', score, id)
redis.call('HSET', job_key, 'status', 'finished', 'finished', fmt_ns(now),
           'pool_id', '')
return 'finished'
"#;

/// ARGV: prefix, id.
///
/// Non-terminal jobs move to cancelled; a running handler is not
/// interrupted, but its terminal transition will find the job no longer
/// executing and leave it alone. Returns the refused terminal status when
/// cancellation is impossible, '' when the job does not exist.
const CANCEL: &str = r#"
local prefix = ARGV[1]
local id = ARGV[2]
local job_key = prefix .. ':jobs:' .. id
local status = redis.call('HGET', job_key, 'status')
if not status then return '' end
if status == 'finished' or status == 'failed' or status == 'cancelled' then
  return status
end
local status_key = prefix .. ':jobs:status:' .. status
local score = redis.call('ZSCORE', status_key, id)
if not score then score = 0 end
redis.call('ZREM', status_key, id)
redis.call('ZADD', prefix .. ':jobs:status:cancelled', score, id)
if status == 'executing' then
  local pool_id = redis.call('HGET', job_key, 'pool_id')
  if pool_id and pool_id ~= '' then
    redis.call('SREM', prefix .. ':jobs:executing:' .. pool_id, id)
  end
end
redis.call('HSET', job_key, 'status', 'cancelled', 'pool_id', '')
return 'cancelled'
"#;

/// ARGV: prefix, id. Removes the job from every index it appears in and
/// deletes its attributes. Returns 0 when the job does not exist.
const DESTROY: &str = r#"
local prefix = ARGV[1]
local id = ARGV[2]
local job_key = prefix .. ':jobs:' .. id
local status = redis.call('HGET', job_key, 'status')
if not status then return 0 end
local type_name = redis.call('HGET', job_key, 'type')
local pool_id = redis.call('HGET', job_key, 'pool_id')
redis.call('ZREM', prefix .. ':jobs:status:' .. status, id)
redis.call('ZREM', prefix .. ':jobs:time', id)
if type_name then
  redis.call('SREM', prefix .. ':jobs:type:' .. type_name, id)
end
if pool_id and pool_id ~= '' then
  redis.call('SREM', prefix .. ':jobs:executing:' .. pool_id, id)
end
redis.call('DEL', job_key)
return 1
"#;

/// ARGV: prefix, pool id, error message.
///
/// Treats every job owned by the pool as freshly failed, then deletes the
/// pool's executing set and heartbeat. Idempotent, so several live pools
/// may race to purge the same dead one.
const PURGE_STALE_POOL: &str = r#"
local prefix = ARGV[1]
local pool_id = ARGV[2]
local err = ARGV[3]
local pool_key = prefix .. ':jobs:executing:' .. pool_id
local ids = redis.call('SMEMBERS', pool_key)
for _, id in ipairs(ids) do
  fail_or_requeue(prefix, id, err, false)
end
redis.call('DEL', pool_key)
redis.call('DEL', prefix .. ':pools:' .. pool_id .. ':heartbeat')
return #ids
"#;

pub(crate) struct Scripts {
    pub(crate) pop_next_jobs: Script,
    pub(crate) retry_or_fail: Script,
    pub(crate) mark_finished: Script,
    pub(crate) cancel: Script,
    pub(crate) destroy: Script,
    pub(crate) purge_stale_pool: Script,
}

impl Scripts {
    pub(crate) fn new() -> Self {
        Self {
            pop_next_jobs: Script::new(&with_helpers(POP_NEXT_JOBS)),
            retry_or_fail: Script::new(&with_helpers(RETRY_OR_FAIL)),
            mark_finished: Script::new(&with_helpers(MARK_FINISHED)),
            cancel: Script::new(CANCEL),
            destroy: Script::new(DESTROY),
            purge_stale_pool: Script::new(&with_helpers(PURGE_STALE_POOL)),
        }
    }
}

fn with_helpers(body: &str) -> String {
    format!("{HELPERS}\n{body}")
}
