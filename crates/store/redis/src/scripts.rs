/// Lua script for taking a fenced lease.
///
/// KEYS\[1\] = lock key
/// KEYS\[2\] = fence key
/// ARGV\[1\] = lock value
/// ARGV\[2\] = owner token
/// ARGV\[3\] = TTL in milliseconds
///
/// Returns 1 if both keys were written, 0 if the lock key already exists.
pub const SET_FENCED_IF_ABSENT: &str = r"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[3]) then
    redis.call('SET', KEYS[2], ARGV[2], 'PX', ARGV[3])
    return 1
end
return 0
";

/// Lua script for extending a fenced lease.
///
/// KEYS\[1\] = lock key
/// KEYS\[2\] = fence key
/// ARGV\[1\] = lock value
/// ARGV\[2\] = owner token
/// ARGV\[3\] = new TTL in milliseconds
///
/// Returns 1 if extended, 0 if either key is missing or holds something else.
pub const EXTEND_FENCED: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] and redis.call('GET', KEYS[2]) == ARGV[2] then
    redis.call('PEXPIRE', KEYS[1], ARGV[3])
    redis.call('PEXPIRE', KEYS[2], ARGV[3])
    return 1
end
return 0
";

/// Lua script for dropping a fenced lease.
///
/// KEYS\[1\] = lock key
/// KEYS\[2\] = fence key
/// ARGV\[1\] = lock value
/// ARGV\[2\] = owner token
///
/// Returns 1 if the lock key was deleted. The fence key is deleted whenever
/// it holds the token.
pub const DELETE_FENCED: &str = r"
if redis.call('GET', KEYS[2]) ~= ARGV[2] then
    return 0
end
redis.call('DEL', KEYS[2])
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
";

/// Lua script for taking a slot in a bounded sorted set.
///
/// KEYS\[1\] = sorted set key
/// ARGV\[1\] = member
/// ARGV\[2\] = score (expiry epoch seconds)
/// ARGV\[3\] = now (epoch seconds)
/// ARGV\[4\] = capacity
///
/// Expired members (score <= now) are pruned first. An existing member is
/// refreshed without counting against capacity.
///
/// Returns 1 if the member holds a slot afterwards, 0 if the set is full.
pub const ADD_BOUNDED: &str = r"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[3])
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
    redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
    return 1
end
if redis.call('ZCARD', KEYS[1]) < tonumber(ARGV[4]) then
    redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
    return 1
end
return 0
";

/// Lua script for refreshing a live member's score.
///
/// KEYS\[1\] = sorted set key
/// ARGV\[1\] = member
/// ARGV\[2\] = new score (expiry epoch seconds)
/// ARGV\[3\] = now (epoch seconds)
///
/// Returns 1 if refreshed, 0 if the member is absent or already expired (an
/// expired member is removed).
pub const RENEW_MEMBER: &str = r"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score then
    return 0
end
if tonumber(score) <= tonumber(ARGV[3]) then
    redis.call('ZREM', KEYS[1], ARGV[1])
    return 0
end
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
return 1
";
