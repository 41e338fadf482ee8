//! Lua scripts backing [`RedisRepository`](super::redis::RedisRepository).
//!
//! Each script runs atomically on the server, which is what makes an entry
//! insert and a multi-entry call-next batch all-or-nothing.

/// Insert a new entry under a unique `(queue, token)` pair.
///
/// Arguments:
/// - KEYS[1]: Token index hash (`queue:{id}:tokens`)
/// - KEYS[2]: Ordered entry set (`queue:{id}:entries`)
/// - KEYS[3]: Entry body key (`entry:{entry_id}`)
/// - ARGV[1]: Token
/// - ARGV[2]: Entry id
/// - ARGV[3]: Entry JSON
///
/// Returns:
/// - 1: Inserted (or the same entry was already present)
/// - 0: Token already held by a different entry
pub const INSERT_ENTRY: &str = r#"
local holder = redis.call('HGET', KEYS[1], ARGV[1])
if holder then
    if holder == ARGV[2] then
        return 1
    end
    return 0
end

redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[1], ARGV[2])
redis.call('SET', KEYS[3], ARGV[3])
return 1
"#;

/// Compare-and-set a batch of entries.
///
/// Arguments:
/// - KEYS[1..n]: Entry body keys
/// - ARGV[2i-1]: Expected state of entry i (e.g. `WAITING`)
/// - ARGV[2i]: New JSON body of entry i
///
/// An entry whose stored body already equals the new body counts as applied.
///
/// Returns:
/// - 0: Every update applied
/// - i > 0: Entry i is in an unexpected state; nothing written
/// - -i < 0: Entry i does not exist; nothing written
pub const APPLY_UPDATES: &str = r#"
for i = 1, #KEYS do
    local stored = redis.call('GET', KEYS[i])
    if not stored then
        return -i
    end
    local expected = ARGV[2 * i - 1]
    local body = ARGV[2 * i]
    if stored ~= body and cjson.decode(stored)['state'] ~= expected then
        return i
    end
end

for i = 1, #KEYS do
    redis.call('SET', KEYS[i], ARGV[2 * i])
end
return 0
"#;

/// Raise a token counter to at least ARGV[1].
///
/// Arguments:
/// - KEYS[1]: Token counter (`queue:{id}:token_seq`)
/// - ARGV[1]: Highest token known to be issued
///
/// Returns the counter value after the call.
pub const SEED_COUNTER: &str = r#"
local floor = tonumber(ARGV[1])
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current < floor then
    redis.call('SET', KEYS[1], floor)
    return floor
end
return current
"#;
