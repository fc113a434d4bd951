/// Shared-secret gate for the wire protocol. Identity and authorization
/// policy live with the upstream gateway; this only keeps strangers off
/// the socket.
#[derive(Debug, Clone)]
pub struct SharedSecret {
    secret: String,
}

impl SharedSecret {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Constant-time comparison so timing doesn't leak prefix matches.
    pub fn verify(&self, presented: &str) -> bool {
        let a = self.secret.as_bytes();
        let b = presented.as_bytes();
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_exact_secret() {
        let auth = SharedSecret::new("wayfare".into());
        assert!(auth.verify("wayfare"));
    }

    #[test]
    fn rejects_wrong_or_partial() {
        let auth = SharedSecret::new("wayfare".into());
        assert!(!auth.verify("wayfar"));
        assert!(!auth.verify("wayfarer"));
        assert!(!auth.verify(""));
        assert!(!auth.verify("WAYFARE"));
    }
}
