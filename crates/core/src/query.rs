use crate::content::strip_code_fences;
use crate::error::CollectError;
use crate::prompts;
use crate::template::{normalize_variable_name, QueryTemplate};
use crate::traits::CompletionModel;
use tracing::{debug, info, warn};

pub const MAX_QUERIES: usize = 10;

/// Asks the model for `num_queries` short search queries for a dataset.
///
/// With variable names the model writes templates that contain every
/// `{variable}` placeholder; templates missing one are kept and logged.
pub async fn generate_search_queries(
    model: &dyn CompletionModel,
    dataset_description: &str,
    num_queries: usize,
    variable_names: &[String],
) -> Result<Vec<QueryTemplate>, CollectError> {
    if !(1..=MAX_QUERIES).contains(&num_queries) {
        return Err(CollectError::InvalidArgument(format!(
            "num_queries must be between 1 and {MAX_QUERIES}, got {num_queries}"
        )));
    }
    if dataset_description.trim().is_empty() {
        return Err(CollectError::InvalidArgument(
            "dataset description is empty".to_string(),
        ));
    }

    let variable_names = variable_names
        .iter()
        .map(|name| normalize_variable_name(name))
        .filter(|name| !name.is_empty())
        .collect::<Vec<_>>();

    let count = num_queries.to_string();
    let prompt = if variable_names.is_empty() {
        prompts::render(
            prompts::GENERATE_QUERIES,
            &[
                ("num_queries", count.as_str()),
                ("dataset_description", dataset_description),
            ],
        )
    } else {
        let placeholders = variable_names
            .iter()
            .map(|name| format!("{{{name}}}"))
            .collect::<Vec<_>>()
            .join(", ");
        prompts::render(
            prompts::GENERATE_QUERY_TEMPLATES,
            &[
                ("num_queries", count.as_str()),
                ("variable_names", placeholders.as_str()),
                ("dataset_description", dataset_description),
            ],
        )
    };

    let reply = model.complete(&prompt).await?;
    let texts = parse_query_list(&reply)?;
    debug!(count = texts.len(), "query generator reply parsed");

    let mut templates = Vec::with_capacity(texts.len());
    for text in texts {
        let template = QueryTemplate::new(text)?;
        let missing = variable_names
            .iter()
            .filter(|name| !template.variables().contains(name))
            .cloned()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            warn!(template = template.text(), ?missing, "query template misses variables");
        }
        templates.push(template);
    }

    info!(requested = num_queries, generated = templates.len(), "generated search queries");
    Ok(templates)
}

fn parse_query_list(reply: &str) -> Result<Vec<String>, CollectError> {
    let cleaned = strip_code_fences(reply);
    let queries: Vec<String> = serde_json::from_str(&cleaned).map_err(|error| {
        CollectError::MalformedResponse(format!("expected a JSON array of strings: {error}"))
    })?;

    Ok(queries
        .into_iter()
        .map(|query| query.trim().to_string())
        .filter(|query| !query.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCompletion;

    #[tokio::test]
    async fn out_of_range_query_count_is_rejected() {
        let model = FakeCompletion::new();
        for count in [0, 11] {
            let result = generate_search_queries(&model, "cholera cases", count, &[]).await;
            assert!(matches!(result, Err(CollectError::InvalidArgument(_))));
        }
        assert_eq!(model.prompt_count(), 0);
    }

    #[tokio::test]
    async fn fenced_reply_is_parsed_into_templates() {
        let model = FakeCompletion::new().reply(
            "query templates",
            "```json\n[\"{country} cholera cases\", \"cholera outbreak {Country} 2023\"]\n```",
        );

        let templates =
            generate_search_queries(&model, "cholera cases", 2, &["Country".to_string()])
                .await
                .unwrap();

        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0].variables(), ["country"]);
        assert_eq!(templates[1].variables(), ["country"]);

        let prompt = model.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("{country}"));
        assert!(prompt.contains("Generate 2 Google Search query templates"));
    }

    #[tokio::test]
    async fn plain_queries_use_the_plain_prompt() {
        let model = FakeCompletion::new().reply("Google Search queries", r#"["acme revenue"]"#);
        let templates = generate_search_queries(&model, "acme revenue", 1, &[])
            .await
            .unwrap();
        assert_eq!(templates[0].text(), "acme revenue");
        assert!(templates[0].variables().is_empty());
    }

    #[tokio::test]
    async fn non_array_reply_is_malformed() {
        let model = FakeCompletion::new().reply("Google Search", "Here are some queries: a, b");
        let result = generate_search_queries(&model, "acme", 2, &[]).await;
        assert!(matches!(result, Err(CollectError::MalformedResponse(_))));
    }
}
