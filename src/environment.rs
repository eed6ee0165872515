use std::collections::HashMap;
use std::fmt::Debug;

pub trait EnvironmentVariableProvider: Send + Sync + Debug {
    fn get(&self, name: &str) -> Option<String>;
}

/// Reads variables from the current process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnvironment;

impl EnvironmentVariableProvider for ProcessEnvironment {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// A fixed set of variables.
#[derive(Debug, Default, Clone)]
pub struct StaticEnvironment {
    variables: HashMap<String, String>,
}

impl StaticEnvironment {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

impl EnvironmentVariableProvider for StaticEnvironment {
    fn get(&self, name: &str) -> Option<String> {
        self.variables.get(name).cloned()
    }
}

// aws.lambda: AWS_EXECUTION_ENV, AWS_LAMBDA_RUNTIME_API
// azure.func: FUNCTIONS_WORKER_RUNTIME
// gcp.func: K_SERVICE, FUNCTION_NAME
// vercel: VERCEL
const FAAS_MARKERS: [&str; 5] = [
    "AWS_LAMBDA_RUNTIME_API",
    "FUNCTIONS_WORKER_RUNTIME",
    "K_SERVICE",
    "FUNCTION_NAME",
    "VERCEL",
];

pub fn is_running_in_faas(provider: &dyn EnvironmentVariableProvider) -> bool {
    if provider
        .get("AWS_EXECUTION_ENV")
        .map(|v| v.starts_with("AWS_Lambda_"))
        .unwrap_or(false)
    {
        return true;
    }

    FAAS_MARKERS.iter().any(|name| provider.get(name).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_environment_is_not_faas() {
        assert!(!is_running_in_faas(&StaticEnvironment::new()));
    }

    #[test]
    fn aws_execution_env_needs_lambda_prefix() {
        let env = StaticEnvironment::new().with("AWS_EXECUTION_ENV", "AWS_ECS_FARGATE");
        assert!(!is_running_in_faas(&env));

        let env = StaticEnvironment::new().with("AWS_EXECUTION_ENV", "AWS_Lambda_java8");
        assert!(is_running_in_faas(&env));
    }

    #[test]
    fn any_marker_is_enough() {
        for name in FAAS_MARKERS {
            let env = StaticEnvironment::new().with(name, "1");
            assert!(is_running_in_faas(&env), "{} should be detected", name);
        }
    }
}
