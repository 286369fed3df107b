use crate::config::{ExtractionConfig, RetrievalConfig};
use crate::error::{CollectError, ConfigError};
use crate::extraction::{generate_extraction_schema, DataExtractor};
use crate::models::{
    ExtractedRecord, ExtractionSchema, QualityFlag, SkippedItem, Variables, WebPage,
};
use crate::quality::QualityController;
use crate::query::generate_search_queries;
use crate::retrieval::PageRetriever;
use crate::template::QueryTemplate;
use crate::traits::{CompletionModel, OcrProvider, PageFetcher, SearchProvider};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

/// Inputs of one end-to-end collection run.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub dataset_description: String,
    pub num_queries: usize,
    pub variables: Variables,
    /// Schema to extract with; designed by the model from `schema_fields`
    /// when absent.
    pub schema: Option<ExtractionSchema>,
    pub schema_fields: Vec<String>,
    pub retrieval: RetrievalConfig,
    pub extraction: ExtractionConfig,
    pub quality_control: bool,
}

impl PipelineRequest {
    pub fn new(dataset_description: impl Into<String>, schema: ExtractionSchema) -> Self {
        Self {
            dataset_description: dataset_description.into(),
            num_queries: 3,
            variables: Variables::new(),
            schema: Some(schema),
            schema_fields: Vec::new(),
            retrieval: RetrievalConfig::default(),
            extraction: ExtractionConfig::default(),
            quality_control: true,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PipelineOutput {
    pub run_id: Uuid,
    pub templates: Vec<QueryTemplate>,
    pub schema: ExtractionSchema,
    pub pages: Vec<WebPage>,
    pub records: Vec<ExtractedRecord>,
    pub flags: Vec<QualityFlag>,
    pub skipped: Vec<SkippedItem>,
}

/// Query generation, retrieval, extraction and quality control in sequence.
pub struct Pipeline<S, F>
where
    S: SearchProvider,
    F: PageFetcher,
{
    model: Arc<dyn CompletionModel>,
    retriever: PageRetriever<S, F>,
    extractor: DataExtractor,
    quality: QualityController,
}

impl<S, F> Pipeline<S, F>
where
    S: SearchProvider,
    F: PageFetcher,
{
    pub fn new(model: Arc<dyn CompletionModel>, retriever: PageRetriever<S, F>) -> Self {
        Self {
            extractor: DataExtractor::new(model.clone()),
            quality: QualityController::new(model.clone()),
            model,
            retriever,
        }
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn OcrProvider>) -> Self {
        self.extractor = self.extractor.with_ocr(ocr);
        self
    }

    /// Runs every stage. Extraction needs page text, so a request with
    /// `retrieval.fetch_pages` off is rejected before any model call.
    pub async fn run(&self, request: &PipelineRequest) -> Result<PipelineOutput, CollectError> {
        if !request.retrieval.fetch_pages {
            return Err(ConfigError::InvalidValue {
                name: "fetch_pages".to_string(),
                details: "the pipeline extracts from page text and must fetch pages".to_string(),
            }
            .into());
        }
        let run_id = Uuid::new_v4();
        self.run_stages(run_id, request)
            .instrument(info_span!("pipeline", %run_id))
            .await
    }

    async fn run_stages(
        &self,
        run_id: Uuid,
        request: &PipelineRequest,
    ) -> Result<PipelineOutput, CollectError> {
        let schema = match &request.schema {
            Some(schema) => schema.clone(),
            None => {
                generate_extraction_schema(
                    self.model.as_ref(),
                    &request.dataset_description,
                    &request.schema_fields,
                )
                .await?
            }
        };

        let variable_names = request.variables.keys().cloned().collect::<Vec<_>>();
        let templates = generate_search_queries(
            self.model.as_ref(),
            &request.dataset_description,
            request.num_queries,
            &variable_names,
        )
        .await?;

        let retrieval = self
            .retriever
            .retrieve(&templates, &request.variables, &request.retrieval)
            .await?;

        let extraction = self
            .extractor
            .extract(retrieval.pages.clone(), &schema, &request.extraction)
            .await?;

        let records = if request.quality_control {
            self.quality
                .control(extraction.records, &request.dataset_description, Some(&schema))
                .await?
        } else {
            extraction.records
        };

        let flags = records
            .iter()
            .flat_map(|record| record.flags.iter().cloned())
            .collect::<Vec<_>>();
        let mut skipped = retrieval.skipped;
        skipped.extend(extraction.skipped);

        info!(
            templates = templates.len(),
            pages = retrieval.pages.len(),
            records = records.len(),
            flags = flags.len(),
            skipped = skipped.len(),
            "pipeline finished"
        );

        Ok(PipelineOutput {
            run_id,
            templates,
            schema,
            pages: retrieval.pages,
            records,
            flags,
            skipped,
        })
    }
}
