//! Per-IP download throttling.
//!
//! Every download attempt, TCP or web, runs through one shared limiter: a
//! sliding window of `max` attempts per `window`, and a flat ban once the
//! window overflows. Uploads are not limited; their cost is bounded by the
//! blob size cap and the connection-per-upload model.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct RlEntry {
    count: u32,
    window_start: Instant,
}

#[derive(Default)]
struct Maps {
    attempts: HashMap<IpAddr, RlEntry>,
    banned: HashMap<IpAddr, Instant>,
}

pub struct RateLimiter {
    maps: Mutex<Maps>,
    max: u32,
    window: Duration,
    ban: Duration,
}

impl RateLimiter {
    pub fn new(max: u32, window: Duration, ban: Duration) -> Self {
        RateLimiter {
            maps: Mutex::new(Maps::default()),
            max,
            window,
            ban,
        }
    }

    /// Records one attempt from `ip` and decides whether to serve it.
    ///
    /// A lapsed ban is cleared and the attempt falls through to a fresh
    /// window. Overflowing the window bans the IP and drops its counter.
    pub fn allow(&self, ip: IpAddr) -> bool {
        let mut maps = self.maps.lock().unwrap();
        let now = Instant::now();

        if let Some(&until) = maps.banned.get(&ip) {
            if now < until {
                return false;
            }
            maps.banned.remove(&ip);
        }

        let over = {
            let entry = maps.attempts.entry(ip).or_insert(RlEntry {
                count: 0,
                window_start: now,
            });
            if now.duration_since(entry.window_start) > self.window {
                entry.count = 0;
                entry.window_start = now;
            }
            entry.count += 1;
            entry.count > self.max
        };
        if over {
            maps.attempts.remove(&ip);
            maps.banned.insert(ip, now + self.ban);
            return false;
        }
        true
    }
}
