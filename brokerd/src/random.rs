// SPDX-License-Identifier: GPL-3.0-or-later

//! Seeded PRNG for minting opaque connection ids.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Default entropy source for the seed.
pub const ENTROPY_FILE_DEFAULT: &str = "/dev/urandom";

pub struct Random {
    rng: StdRng,
}

impl Random {
    /// Seed the generator from the first 8 bytes of `path`.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures opening or reading the file.
    pub fn seed_from_file(path: &Path) -> std::io::Result<Random> {
        let mut file = File::open(path)?;
        let mut seed = [0_u8; 8];
        file.read_exact(&mut seed)?;
        Ok(Random {
            rng: StdRng::seed_from_u64(u64::from_ne_bytes(seed)),
        })
    }

    pub fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    /// A nonzero id suitable for identifying a connection.
    pub fn next_id(&mut self) -> u64 {
        loop {
            let id = self.next_u64();
            if id != 0 {
                return id;
            }
        }
    }
}
