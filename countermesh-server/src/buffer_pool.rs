// Copyright 2025 CounterMesh Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Pooled byte-buffer allocator, tiered by size (spec §5/§9: large
//! response bodies should come from a freelist rather than a fresh
//! allocation per request). Buffers are returned to their tier's list
//! on `Drop`.

use parking_lot::Mutex;
use std::sync::Arc;

const SMALL: usize = 4 * 1024;
const MEDIUM: usize = 64 * 1024;
const LARGE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Small,
    Medium,
    Large,
}

impl Tier {
    fn capacity(self) -> usize {
        match self {
            Tier::Small => SMALL,
            Tier::Medium => MEDIUM,
            Tier::Large => LARGE,
        }
    }

    fn for_size(requested: usize) -> Self {
        if requested <= SMALL {
            Tier::Small
        } else if requested <= MEDIUM {
            Tier::Medium
        } else {
            Tier::Large
        }
    }
}

struct Freelists {
    small: Vec<Vec<u8>>,
    medium: Vec<Vec<u8>>,
    large: Vec<Vec<u8>>,
}

pub struct BufferPool {
    lists: Mutex<Freelists>,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lists: Mutex::new(Freelists {
                small: Vec::new(),
                medium: Vec::new(),
                large: Vec::new(),
            }),
        })
    }

    /// Check out a buffer with at least `requested` bytes of capacity
    /// from the smallest tier that fits.
    pub fn checkout(self: &Arc<Self>, requested: usize) -> PooledBuffer {
        let tier = Tier::for_size(requested);
        let mut lists = self.lists.lock();
        let free = match tier {
            Tier::Small => &mut lists.small,
            Tier::Medium => &mut lists.medium,
            Tier::Large => &mut lists.large,
        };
        let mut buf = free.pop().unwrap_or_else(|| Vec::with_capacity(tier.capacity()));
        buf.clear();
        PooledBuffer {
            buf: Some(buf),
            tier,
            pool: self.clone(),
        }
    }

    fn release(&self, tier: Tier, buf: Vec<u8>) {
        let mut lists = self.lists.lock();
        let free = match tier {
            Tier::Small => &mut lists.small,
            Tier::Medium => &mut lists.medium,
            Tier::Large => &mut lists.large,
        };
        free.push(buf);
    }

    #[cfg(test)]
    fn tier_len(&self, tier: Tier) -> usize {
        let lists = self.lists.lock();
        match tier {
            Tier::Small => lists.small.len(),
            Tier::Medium => lists.medium.len(),
            Tier::Large => lists.large.len(),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self {
            lists: Mutex::new(Freelists {
                small: Vec::new(),
                medium: Vec::new(),
                large: Vec::new(),
            }),
        }
    }
}

/// RAII guard around a checked-out buffer; returns it to its tier's
/// freelist on drop.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    tier: Tier,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Take ownership of the underlying buffer without returning it to
    /// the pool — for handing a checked-out buffer off as a response
    /// body, where the client (not this pool) now owns its lifetime.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.buf.take().expect("buffer already taken")
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().expect("buffer taken before drop")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buffer taken before drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(self.tier, buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_picks_the_right_tier() {
        let pool = BufferPool::new();
        let small = pool.checkout(100);
        assert!(small.capacity() >= 100);

        let large = pool.checkout(500_000);
        assert!(large.capacity() >= 500_000);
    }

    #[test]
    fn returned_buffer_is_reused_not_reallocated() {
        let pool = BufferPool::new();
        {
            let mut buf = pool.checkout(100);
            buf.extend_from_slice(b"hello");
        }
        assert_eq!(pool.tier_len(Tier::Small), 1);

        let reused = pool.checkout(100);
        assert!(reused.is_empty(), "checkout must clear the buffer");
        assert_eq!(pool.tier_len(Tier::Small), 0);
    }
}
