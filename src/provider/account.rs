//! Provider accounts and model-spec resolution.
//!
//! A model spec is either `provider:model` or a bare name. Resolution
//! happens freshly for every call (accounts can change between calls;
//! nothing is cached) and produces an ephemeral [`ResolvedCall`]:
//!
//! 1. the prefix, or the bare name itself, matches a configured enabled
//!    account (case-insensitive) — the account wins; a bare account name
//!    uses the account's own default model;
//! 2. otherwise a prefix must name a built-in provider (`openai`,
//!    `openrouter`, `groq`, `local`), whose base URL and API key come
//!    from the environment;
//! 3. an unmatched prefix is a hard configuration error;
//! 4. a bare name with no account match runs on the `local` provider
//!    (Ollama-style endpoint, no key) with the bare name as the model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CallError;

/// A configured provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAccount {
    /// Account name matched against spec prefixes (case-insensitive).
    pub name: String,
    /// Chat-completions base URL, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Bearer token; empty means no Authorization header.
    #[serde(default)]
    pub api_key: String,
    /// Model used when the spec is just this account's name.
    #[serde(default)]
    pub default_model: Option<String>,
    /// Extra headers applied verbatim to every request.
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    /// Disabled accounts are skipped during resolution.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Everything needed to issue one HTTP call. Recomputed per call, never
/// stored.
#[derive(Debug, Clone)]
pub struct ResolvedCall {
    /// Display name for logs (account or builtin name).
    pub provider: String,
    pub base_url: String,
    /// Empty means anonymous (local endpoints).
    pub api_key: String,
    pub model: String,
    pub extra_headers: HashMap<String, String>,
}

/// Name of the builtin fallback provider for bare model names.
pub const LOCAL_PROVIDER: &str = "local";

struct BuiltinProvider {
    name: &'static str,
    /// Env var holding the API key; `None` means no key required.
    key_env: Option<&'static str>,
    /// Env var overriding the base URL.
    base_env: &'static str,
    default_base: &'static str,
}

const BUILTIN_PROVIDERS: &[BuiltinProvider] = &[
    BuiltinProvider {
        name: "openai",
        key_env: Some("OPENAI_API_KEY"),
        base_env: "OPENAI_BASE_URL",
        default_base: "https://api.openai.com/v1",
    },
    BuiltinProvider {
        name: "openrouter",
        key_env: Some("OPENROUTER_API_KEY"),
        base_env: "OPENROUTER_BASE_URL",
        default_base: "https://openrouter.ai/api/v1",
    },
    BuiltinProvider {
        name: "groq",
        key_env: Some("GROQ_API_KEY"),
        base_env: "GROQ_BASE_URL",
        default_base: "https://api.groq.com/openai/v1",
    },
    BuiltinProvider {
        name: LOCAL_PROVIDER,
        key_env: None,
        base_env: "KINDRED_LOCAL_BASE_URL",
        default_base: "http://localhost:11434/v1",
    },
];

/// Resolve a model spec against configured accounts and the process
/// environment.
///
/// # Errors
/// Returns [`CallError::Config`] for a malformed spec, an unknown
/// provider prefix, a missing required credential, or an account with no
/// default model matched by bare name.
pub fn resolve(spec: &str, accounts: &[ProviderAccount]) -> Result<ResolvedCall, CallError> {
    resolve_with(spec, accounts, &|key| std::env::var(key).ok())
}

/// Resolution with an injected environment lookup (tests use closures
/// instead of mutating the process environment).
pub fn resolve_with(
    spec: &str,
    accounts: &[ProviderAccount],
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<ResolvedCall, CallError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(CallError::Config("empty model spec".into()));
    }

    match spec.split_once(':') {
        Some((prefix, model)) => {
            if prefix.is_empty() || model.is_empty() {
                return Err(CallError::Config(format!("malformed model spec '{spec}'")));
            }
            if let Some(account) = find_account(accounts, prefix) {
                return Ok(from_account(account, model));
            }
            match find_builtin(prefix) {
                Some(builtin) => from_builtin(builtin, model, lookup),
                None => Err(CallError::Config(format!("unknown provider '{prefix}'"))),
            }
        }
        None => {
            if let Some(account) = find_account(accounts, spec) {
                return match &account.default_model {
                    Some(model) => Ok(from_account(account, model)),
                    None => Err(CallError::Config(format!(
                        "account '{}' has no default model",
                        account.name
                    ))),
                };
            }
            // Bare model name: run it on the local endpoint.
            let local = find_builtin(LOCAL_PROVIDER)
                .unwrap_or_else(|| unreachable!("local provider is always builtin"));
            from_builtin(local, spec, lookup)
        }
    }
}

fn find_account<'a>(accounts: &'a [ProviderAccount], name: &str) -> Option<&'a ProviderAccount> {
    accounts
        .iter()
        .find(|a| a.enabled && a.name.eq_ignore_ascii_case(name))
}

fn find_builtin(name: &str) -> Option<&'static BuiltinProvider> {
    BUILTIN_PROVIDERS
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
}

fn from_account(account: &ProviderAccount, model: &str) -> ResolvedCall {
    ResolvedCall {
        provider: account.name.clone(),
        base_url: account.base_url.clone(),
        api_key: account.api_key.clone(),
        model: model.to_owned(),
        extra_headers: account.extra_headers.clone(),
    }
}

fn from_builtin(
    builtin: &BuiltinProvider,
    model: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<ResolvedCall, CallError> {
    let base_url = lookup(builtin.base_env)
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| builtin.default_base.to_owned());

    let api_key = match builtin.key_env {
        Some(env) => lookup(env).filter(|v| !v.trim().is_empty()).ok_or_else(|| {
            CallError::Config(format!(
                "provider '{}' requires the {env} environment variable",
                builtin.name
            ))
        })?,
        None => String::new(),
    };

    Ok(ResolvedCall {
        provider: builtin.name.to_owned(),
        base_url,
        api_key,
        model: model.to_owned(),
        extra_headers: HashMap::new(),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn account(name: &str, default_model: Option<&str>) -> ProviderAccount {
        ProviderAccount {
            name: name.into(),
            base_url: format!("https://{name}.example/v1"),
            api_key: "sk-test".into(),
            default_model: default_model.map(String::from),
            extra_headers: HashMap::new(),
            enabled: true,
        }
    }

    #[test]
    fn account_prefix_wins_case_insensitively() {
        let accounts = vec![account("MyBox", None)];
        let call = resolve_with("mybox:llama3", &accounts, &no_env).unwrap();
        assert_eq!(call.provider, "MyBox");
        assert_eq!(call.model, "llama3");
        assert_eq!(call.base_url, "https://MyBox.example/v1");
    }

    #[test]
    fn bare_account_name_uses_its_default_model() {
        let accounts = vec![account("mybox", Some("llama3"))];
        let call = resolve_with("MYBOX", &accounts, &no_env).unwrap();
        assert_eq!(call.model, "llama3");
    }

    #[test]
    fn bare_account_name_without_default_model_errors() {
        let accounts = vec![account("mybox", None)];
        let err = resolve_with("mybox", &accounts, &no_env).unwrap_err();
        assert!(matches!(err, CallError::Config(_)));
        assert!(format!("{err}").contains("mybox"));
    }

    #[test]
    fn disabled_account_is_skipped() {
        let mut acc = account("openai", None);
        acc.enabled = false;
        // Falls through to the builtin, which needs a key.
        let err = resolve_with("openai:gpt-4o", &[acc], &no_env).unwrap_err();
        assert!(format!("{err}").contains("OPENAI_API_KEY"));
    }

    #[test]
    fn builtin_reads_key_and_base_from_env() {
        let lookup = |key: &str| match key {
            "OPENAI_API_KEY" => Some("sk-live".to_owned()),
            "OPENAI_BASE_URL" => Some("https://proxy.example/v1".to_owned()),
            _ => None,
        };
        let call = resolve_with("openai:gpt-4o-mini", &[], &lookup).unwrap();
        assert_eq!(call.provider, "openai");
        assert_eq!(call.api_key, "sk-live");
        assert_eq!(call.base_url, "https://proxy.example/v1");
        assert_eq!(call.model, "gpt-4o-mini");
    }

    #[test]
    fn builtin_missing_credential_is_config_error() {
        let err = resolve_with("groq:llama-3.1-8b", &[], &no_env).unwrap_err();
        assert_eq!(err.code(), "CONFIG_INVALID");
        assert!(format!("{err}").contains("GROQ_API_KEY"));
    }

    #[test]
    fn unknown_prefix_is_hard_error_naming_it() {
        let err = resolve_with("nova:gpt-5", &[], &no_env).unwrap_err();
        assert!(format!("{err}").contains("unknown provider 'nova'"));
    }

    #[test]
    fn bare_name_falls_back_to_local() {
        let call = resolve_with("llama3", &[], &no_env).unwrap();
        assert_eq!(call.provider, "local");
        assert_eq!(call.base_url, "http://localhost:11434/v1");
        assert!(call.api_key.is_empty());
        assert_eq!(call.model, "llama3");
    }

    #[test]
    fn local_base_override_respected() {
        let lookup = |key: &str| {
            (key == "KINDRED_LOCAL_BASE_URL").then(|| "http://box:8080/v1".to_owned())
        };
        let call = resolve_with("local:qwen", &[], &lookup).unwrap();
        assert_eq!(call.base_url, "http://box:8080/v1");
    }

    #[test]
    fn malformed_specs_error() {
        assert!(resolve_with("", &[], &no_env).is_err());
        assert!(resolve_with("  ", &[], &no_env).is_err());
        assert!(resolve_with("openai:", &[], &no_env).is_err());
        assert!(resolve_with(":gpt-4o", &[], &no_env).is_err());
    }

    #[test]
    fn account_shadows_builtin_of_same_name() {
        let accounts = vec![account("openai", None)];
        let call = resolve_with("openai:gpt-4o", &accounts, &no_env).unwrap();
        // The configured account wins; no env key needed.
        assert_eq!(call.base_url, "https://openai.example/v1");
        assert_eq!(call.api_key, "sk-test");
    }
}
