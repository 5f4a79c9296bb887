//! Server-side scripts evaluated atomically by the backing store.
//!
//! Both scripts read the current time from the store itself (`TIME`), so
//! every process sharing a store agrees on one timeline. Times are measured
//! in seconds since [`GCRA_EPOCH_UNIX_SECS`] to keep the float arithmetic
//! precise.

/// 2017-01-01T00:00:00Z, the zero point of every persisted TAT.
pub const GCRA_EPOCH_UNIX_SECS: u64 = 1_483_228_800;

/// Reply value meaning "not applicable".
pub const SENTINEL: &str = "-1";

/// Scripts the limiter asks a store to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Script {
    /// Evaluate the GCRA decision for one key and persist the new TAT when
    /// the request is admitted.
    ///
    /// `KEYS[1]` is the key; `ARGV` is burst, rate, period in seconds, cost.
    /// Replies `{allowed, remaining, retry_after, reset_after}`.
    AllowN,
    /// Report how far the key's TAT lies in the future. Never writes.
    ///
    /// Replies a decimal number of seconds, or `"-1"` when the key is
    /// absent or already fully replenished.
    Peek,
}

impl Script {
    /// Lua source of this script.
    pub fn source(&self) -> &'static str {
        match self {
            Script::AllowN => ALLOW_N_LUA,
            Script::Peek => PEEK_LUA,
        }
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Script::AllowN => "allow_n",
            Script::Peek => "peek",
        }
    }
}

impl std::fmt::Display for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// Based on https://github.com/rwz/redis-gcra (MIT, Copyright (c) 2017 Pavel Pravosud).
// redis.replicate_commands requires Redis 3.2+.
const ALLOW_N_LUA: &str = r#"
redis.replicate_commands()

local rate_limit_key = KEYS[1]
local burst = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local period = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])

local emission_interval = period / rate
local increment = emission_interval * cost
local burst_offset = emission_interval * burst

local now = redis.call("TIME")
local jan_1_2017 = 1483228800
now = (now[1] - jan_1_2017) + (now[2] / 1000000)

local tat = redis.call("GET", rate_limit_key)
if not tat then
  tat = now
else
  tat = tonumber(tat)
end

if cost > burst then
  return {0, 0, "-1", tostring(tat - now)}
end

local new_tat = math.max(tat, now) + increment
local allow_at = new_tat - burst_offset
local diff = now - allow_at

local remaining = math.floor(diff / emission_interval + 0.5)

local allowed
local retry_after
local reset_after

if remaining < 0 then
  allowed = 0
  remaining = 0
  reset_after = tat - now
  retry_after = diff * -1
  if retry_after > burst then
    retry_after = -1
  end
else
  allowed = cost
  reset_after = new_tat - now
  redis.call("SET", rate_limit_key, new_tat, "EX", math.ceil(reset_after))
  retry_after = -1
end

return {allowed, remaining, tostring(retry_after), tostring(reset_after)}
"#;

const PEEK_LUA: &str = r#"
local tat = redis.call("GET", KEYS[1])
if not tat then
  return "-1"
end

local now = redis.call("TIME")
local jan_1_2017 = 1483228800
now = (now[1] - jan_1_2017) + (now[2] / 1000000)

local ttl = tonumber(tat) - now
if ttl <= 0 then
  return "-1"
end
return tostring(ttl)
"#;
