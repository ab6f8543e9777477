//! Per-frame AES-128-CTR encryption for cast streams.
//!
//! Every frame is encrypted independently. The 16-byte nonce is the
//! session IV mask with the big-endian frame id XORed into bytes 8..12:
//! ```text
//!  byte  0 ..  7   8 .. 11   12 .. 15
//!       iv_mask   iv_mask    iv_mask
//!                 ^ frame_id
//! ```

use aes::cipher::{KeyIvInit, StreamCipher};

use crate::mirroring::stream::EncryptionKeys;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

pub struct FrameCipher {
    key: [u8; 16],
    iv_mask: [u8; 16],
}

impl FrameCipher {
    pub fn new(keys: &EncryptionKeys) -> Self {
        Self {
            key: keys.aes_key,
            iv_mask: keys.aes_iv_mask,
        }
    }

    /// An all-zero key means the offer carried no usable key material.
    pub fn is_valid(&self) -> bool {
        self.key.iter().any(|&b| b != 0)
    }

    pub fn nonce(&self, frame_id: u32) -> [u8; 16] {
        let mut nonce = self.iv_mask;
        for (n, f) in nonce[8..12].iter_mut().zip(frame_id.to_be_bytes()) {
            *n ^= f;
        }
        nonce
    }

    /// Encrypt or decrypt `data` in place. CTR mode is its own inverse.
    pub fn apply(&self, frame_id: u32, data: &mut [u8]) {
        let nonce = self.nonce(frame_id);
        let mut cipher = Aes128Ctr::new((&self.key).into(), (&nonce).into());
        cipher.apply_keystream(data);
    }

    pub fn encrypt(&self, frame_id: u32, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.apply(frame_id, &mut out);
        out
    }
}
