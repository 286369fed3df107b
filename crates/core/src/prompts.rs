//! Prompt templates. Placeholders are `{{name}}` and filled by [`render`].

pub const GENERATE_QUERIES: &str = r#"You generate web search queries. Each query should find pages holding one or a few individual data points, not complete datasets or lists. Keep every query very short and plain: reuse the keywords of the dataset description and write the first query that comes to mind rather than a creative one. Return ONLY a JSON array of query strings, with no explanation or extra text.

Generate {{num_queries}} Google Search queries for this dataset description:
{{dataset_description}}"#;

pub const GENERATE_QUERY_TEMPLATES: &str = r#"You generate web search query templates. Each template should find pages holding one or a few individual data points, not complete datasets or lists. Keep every template very short and plain: reuse the keywords of the dataset description and write the first template that comes to mind rather than a creative one. Every template MUST contain ALL of these placeholders, each wrapped in curly braces: {{variable_names}}. Return ONLY a JSON array of template strings, with no explanation or extra text.

Generate {{num_queries}} Google Search query templates for this dataset description:
{{dataset_description}}"#;

pub const GENERATE_EXTRACTION_SCHEMA: &str = r#"Design an extraction schema from a list of fields and a dataset description.

Rules:
1. Create one field for each item in the list of fields and the dataset description.
2. Give each field a type: "string", "integer", "number" or "boolean". No other types are allowed.
3. Give each field a short description of what it holds.
4. Date fields are strings in YYYY-MM-DD format.
5. Field names are snake_case.

Reply with a JSON object of this form:
{"name": "CholeraCases", "fields": [{"name": "country", "type": "string", "description": "Country the case count is reported for"}, {"name": "date", "type": "string", "description": "Date of the report in YYYY-MM-DD format"}, {"name": "cholera_cases", "type": "integer", "description": "Number of reported cholera cases"}]}

Fields: {{schema_fields}}
Dataset description: {{dataset_description}}

Return ONLY the JSON object, with no explanation and no code fences."#;

pub const EXTRACT_DATA: &str = r#"From the page content below, extract every {{schema_name}} that is mentioned. Only extract a value when it matches what the field describes; do not use related or similar information. {{extra_instruction}}

Each item must follow this JSON schema:
{{json_schema}}

Return ONLY a JSON array of items (an empty array when nothing matches), with no explanation and no code fences.

Page url: {{url}}
Page content:
{{content}}"#;

pub const QUALITY_CONTROL: &str = r#"Below is a dataset collected from the web by an LLM for this request:
{{dataset_description}}

{{extracted_data}}

Examine each row and sanity check it: find as many potential problems with it as you can and make sure it is consistent with the rest of the data. Output EXACTLY one line per ID. Do not skip rows, do not add rows and do not merge the issues of several rows. Always refer to rows by their ID.

Format each line as:
ID: one sentence describing the potential problems of that row, or only "NA" when the row has no issues.
"#;

/// Substitutes `{{name}}` placeholders.
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    values
        .iter()
        .fold(template.to_string(), |rendered, (name, value)| {
            rendered.replace(&format!("{{{{{name}}}}}"), value)
        })
}
