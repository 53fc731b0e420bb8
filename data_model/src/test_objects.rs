pub mod tests {
    use std::collections::HashMap;

    use crate::{
        FunctionMetadata,
        FunctionMetadataBuilder,
        InvocationRequest,
        KnownTrigger,
        SpecializationContext,
    };

    pub const TEST_LANGUAGE: &str = "node";
    pub const TEST_OTHER_LANGUAGE: &str = "python";
    pub const TEST_HTTP_FUNCTION: &str = "http_fn";
    pub const TEST_TIMER_FUNCTION: &str = "timer_fn";

    pub fn mock_function(name: &str, language: &str, trigger: KnownTrigger) -> FunctionMetadata {
        FunctionMetadataBuilder::default()
            .name(name.to_string())
            .language(language.to_string())
            .trigger_type(trigger.as_ref().to_string())
            .script_file(Some(format!("{}/index.js", name)))
            .build()
            .unwrap()
    }

    pub fn mock_functions() -> Vec<FunctionMetadata> {
        vec![
            mock_function(TEST_HTTP_FUNCTION, TEST_LANGUAGE, KnownTrigger::HttpTrigger),
            mock_function(
                TEST_TIMER_FUNCTION,
                TEST_LANGUAGE,
                KnownTrigger::TimerTrigger,
            ),
        ]
    }

    pub fn mock_invocation(function_name: &str) -> InvocationRequest {
        InvocationRequest::new(function_name, serde_json::json!({"input": function_name}))
    }

    pub fn mock_specialization_context() -> SpecializationContext {
        SpecializationContext {
            worker_runtime: TEST_LANGUAGE.to_string(),
            script_root: None,
            app_settings: HashMap::from([("FUNCTIONS_WORKER_RUNTIME".to_string(), TEST_LANGUAGE.to_string())]),
        }
    }
}
