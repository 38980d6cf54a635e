//! Lua sources for the four lock scripts.
//!
//! Each script is atomic on the server and never reads the wall clock.
//! The lock key holds the holder identity; the sibling reentry key holds
//! the integer reentry depth and shares the lock key's TTL. Operators
//! must not delete either key directly: the scripts assume the pair
//! expires jointly, which holds for Redis expiry but not for manual
//! `DEL`.

/// Acquire or reenter a lock.
///
/// KEYS\[1\] = lock key
/// KEYS\[2\] = reentry key
/// ARGV\[1\] = holder identity
/// ARGV\[2\] = TTL in milliseconds
///
/// Returns 1 on first acquire, 2 on reentry by the same holder (both
/// TTLs refreshed), 0 when held by a different holder.
pub const ACQUIRE: &str = r"
local holder = redis.call('GET', KEYS[1])
if not holder then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    redis.call('SET', KEYS[2], 1, 'PX', ARGV[2])
    return 1
end
if holder == ARGV[1] then
    redis.call('INCR', KEYS[2])
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    redis.call('PEXPIRE', KEYS[2], ARGV[2])
    return 2
end
return 0
";

/// Extend a held lock's TTL.
///
/// KEYS\[1\] = lock key
/// KEYS\[2\] = reentry key
/// ARGV\[1\] = holder identity
/// ARGV\[2\] = new TTL in milliseconds
///
/// Returns 1 if extended, 0 if the lease is lost or was never held.
pub const RENEW: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    redis.call('PEXPIRE', KEYS[2], ARGV[2])
    return 1
end
return 0
";

/// Release one level of a held lock.
///
/// KEYS\[1\] = lock key
/// KEYS\[2\] = reentry key
/// ARGV\[1\] = holder identity
///
/// Returns -1 when the caller is not the holder, the remaining reentry
/// depth on a partial release, 0 once both keys are deleted.
pub const RELEASE: &str = r"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
    return -1
end
local depth = redis.call('DECR', KEYS[2])
if depth > 0 then
    return depth
end
redis.call('DEL', KEYS[1], KEYS[2])
return 0
";

/// Increment and return the fencing-token counter.
///
/// KEYS\[1\] = counter key
///
/// Returns the new counter value.
pub const COUNTER: &str = r"
return redis.call('INCR', KEYS[1])
";
