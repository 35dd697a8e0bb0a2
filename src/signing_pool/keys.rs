use zeroize::{Zeroize, Zeroizing};

/// Private key bytes moved into a worker message. Each message owns its own
/// heap copy, which is wiped when dropped. Moving the message moves only the
/// pointer, so no stray copies of the bytes are left behind on the stack.
pub struct KeyMaterial(Box<Zeroizing<[u8; 32]>>);

impl KeyMaterial {
    pub fn copy_from(key: &[u8; 32]) -> Self {
        let mut bytes = Box::new(Zeroizing::new([0u8; 32]));
        bytes.copy_from_slice(key);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn wipe(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}
