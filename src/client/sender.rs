//! Rate-limited payload emission.
//!
//! One thread generates a random payload every `1/rate` seconds, records
//! the digest the server should echo back, and writes the payload out.

use crate::config::Tuning;
use crate::digest::wire_digest;
use crate::stats::ClientStats;
use mio::net::TcpStream;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, trace};

/// xorshift64 payload generator. Quality is irrelevant here; the payloads
/// only need to vary so the digests do.
pub struct PayloadGenerator {
    state: u64,
}

impl PayloadGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    pub fn from_clock() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);
        Self::new(nanos)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Fill `buf` with pseudo-random bytes.
    pub fn fill(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}

/// Spawn the sender thread. Each iteration: generate a payload, record the
/// expected digest in the pending list, write the payload, sleep out the
/// rest of the interval.
pub fn spawn_sender(
    stream: Arc<Mutex<TcpStream>>,
    pending: Arc<Mutex<Vec<String>>>,
    stats: Arc<ClientStats>,
    rate: u64,
    tuning: Tuning,
) {
    thread::Builder::new()
        .name("sender".to_string())
        .spawn(move || {
            let interval = Duration::from_secs_f64(1.0 / rate as f64);
            let mut generator = PayloadGenerator::from_clock();
            let mut payload = vec![0u8; tuning.payload_size];

            loop {
                generator.fill(&mut payload);
                let expected = wire_digest(&payload, tuning.digest_width);

                // Record the expectation before the payload hits the wire,
                // so a fast response can never race past it
                pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(expected);

                if let Err(e) = write_payload(&stream, &payload) {
                    error!(error = %e, "Send failed, stopping sender");
                    return;
                }
                stats.record_sent();
                trace!("Payload sent");

                thread::sleep(interval);
            }
        })
        .expect("failed to spawn sender thread");
}

/// Write the full payload, looping on partial writes. The stream lock is
/// released between retries so the reader thread is not starved.
fn write_payload(stream: &Arc<Mutex<TcpStream>>, payload: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < payload.len() {
        let result = {
            let mut stream = stream.lock().unwrap_or_else(PoisonError::into_inner);
            stream.write(&payload[written..])
        };
        match result {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(1));
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generator_varies_output() {
        let mut generator = PayloadGenerator::new(42);
        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        generator.fill(&mut a);
        generator.fill(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_generator_deterministic_per_seed() {
        let mut g1 = PayloadGenerator::new(7);
        let mut g2 = PayloadGenerator::new(7);
        let mut a = vec![0u8; 32];
        let mut b = vec![0u8; 32];
        g1.fill(&mut a);
        g2.fill(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_generator_fills_odd_lengths() {
        let mut generator = PayloadGenerator::new(3);
        let mut buf = vec![0u8; 13];
        generator.fill(&mut buf);
        assert!(buf.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_zero_seed_survives() {
        let mut generator = PayloadGenerator::new(0);
        assert_ne!(generator.next_u64(), 0);
    }
}
