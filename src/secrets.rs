//! Minimal `secret:KEY` resolution backed by process environment variables.
//! Secrets never pass through `SessionState` — they're fetched on demand at
//! substitution time and never written to history or the event stream.

use crate::resolver::SecretResolver;

pub struct EnvSecretResolver {
    prefix: String,
}

impl EnvSecretResolver {
    /// `prefix` is prepended (upper-cased, with `_` separator) to every
    /// lookup, e.g. prefix `FLOWTIDE` + name `stripe_key` reads
    /// `FLOWTIDE_STRIPE_KEY`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    fn env_name(&self, name: &str) -> String {
        format!("{}_{}", self.prefix, name.to_uppercase())
    }
}

impl SecretResolver for EnvSecretResolver {
    fn resolve(&self, name: &str) -> Option<String> {
        std::env::var(self.env_name(name)).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_prefixed_env_var() {
        let key = "FLOWTIDE_TEST_SECRET_EXAMPLE";
        unsafe { std::env::set_var(key, "value") };
        let resolver = EnvSecretResolver::new("FLOWTIDE_TEST");
        assert_eq!(resolver.resolve("secret_example"), Some("value".to_string()));
        unsafe { std::env::remove_var(key) };
    }

    #[test]
    fn missing_secret_resolves_to_none() {
        let resolver = EnvSecretResolver::new("FLOWTIDE_TEST_UNSET_PREFIX");
        assert_eq!(resolver.resolve("nope"), None);
    }
}
