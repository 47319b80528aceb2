//! SHA-1 engine.
//!
//! The platform hashes title contents and hash subtables with SHA-1; the
//! engine exposes the usual init/update/finalize command triple.

use parking_lot::Mutex;
use sha1::Digest;
use sha1::Sha1;

/// Digest size in bytes.
pub const DIGEST_LEN: usize = 20;

/// The shared SHA engine.
#[derive(Debug, Default)]
pub struct ShaEngine {
    busy: Mutex<()>,
}

/// An in-progress hash, fed through the engine in chunks.
#[derive(Clone, Debug, Default)]
pub struct ShaContext {
    state: Sha1,
}

impl ShaEngine {
    /// Create the engine singleton.
    pub fn new() -> ShaEngine {
        ShaEngine::default()
    }

    /// Begin a new hash.
    pub fn init(&self) -> ShaContext {
        ShaContext::default()
    }

    /// Feed `data` into `ctx`.
    pub fn update(&self, ctx: &mut ShaContext, data: &[u8]) {
        let _cmd = self.busy.lock();
        ctx.state.update(data);
    }

    /// Finish the hash and return the digest.
    pub fn finalize(&self, ctx: ShaContext) -> [u8; DIGEST_LEN] {
        let _cmd = self.busy.lock();
        ctx.state.finalize().into()
    }

    /// One-shot digest.
    pub fn digest(&self, data: &[u8]) -> [u8; DIGEST_LEN] {
        let mut ctx = self.init();
        self.update(&mut ctx, data);
        self.finalize(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        let engine = ShaEngine::new();
        assert_eq!(
            engine.digest(b"abc"),
            [
                0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78,
                0x50, 0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d,
            ]
        );
    }

    #[test]
    fn chunked_equals_oneshot() {
        let engine = ShaEngine::new();
        let data: Vec<u8> = (0u8..=255).cycle().take(1000).collect();
        let mut ctx = engine.init();
        for chunk in data.chunks(77) {
            engine.update(&mut ctx, chunk);
        }
        assert_eq!(engine.finalize(ctx), engine.digest(&data));
    }
}
