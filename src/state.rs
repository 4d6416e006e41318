use std::sync::Arc;

use diesel::{
    pg::PgConnection,
    r2d2::{ConnectionManager, PooledConnection},
};

use crate::{
    config::AppConfig,
    content::NativeExtractor,
    db::PgPool,
    error::{AppError, AppResult},
    extract::{
        BorrowerExtractor, ExtractionEngine, ExtractionRouter, GeminiClient, GroundedExtractor,
    },
    ocr::{CircuitBreaker, GpuOcrClient, OcrEngine, OcrRouter},
    pipeline::DocumentPipeline,
    queue::{HttpTaskDispatcher, TaskDispatcher},
    storage::ObjectStorage,
    store::{BorrowerSink, DocumentStore, PgBorrowerSink, PgDocumentStore},
};

type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn ObjectStorage>,
    pub documents: Arc<dyn DocumentStore>,
    pub borrowers: Arc<dyn BorrowerSink>,
    pub pipeline: Arc<DocumentPipeline>,
    pub dispatcher: Option<Arc<dyn TaskDispatcher>>,
}

impl AppState {
    /// Wire the production pipeline: Postgres stores, the native extractor,
    /// the GPU OCR router behind its process-wide breaker, and the LLM
    /// extraction router.
    pub fn build(pool: PgPool, config: AppConfig, storage: Arc<dyn ObjectStorage>) -> Self {
        let config = Arc::new(config);
        let documents: Arc<dyn DocumentStore> = Arc::new(PgDocumentStore::new(pool.clone()));
        let borrowers: Arc<dyn BorrowerSink> = Arc::new(PgBorrowerSink::new(pool.clone()));

        let native = Arc::new(NativeExtractor::new());
        let gpu = Arc::new(GpuOcrClient::new(
            config.gpu_ocr_url.clone().unwrap_or_default(),
            config.gpu_ocr_auth_token.clone(),
            config.gpu_ocr_model.clone(),
        ));
        let breaker = Arc::new(CircuitBreaker::default());
        let ocr: Arc<dyn OcrEngine> = Arc::new(
            OcrRouter::new(gpu, native, breaker).with_render_dpi(config.ocr_render_dpi),
        );

        let llm = Arc::new(GeminiClient::new(
            config.llm_api_base.clone(),
            config.llm_api_key.clone(),
            config.llm_flash_model.clone(),
            config.llm_pro_model.clone(),
        ));
        let extraction: Arc<dyn ExtractionEngine> = Arc::new(ExtractionRouter::new(
            BorrowerExtractor::new(llm.clone()),
            GroundedExtractor::new(llm),
        ));

        let pipeline = Arc::new(
            DocumentPipeline::new(
                documents.clone(),
                borrowers.clone(),
                storage.clone(),
                ocr,
                extraction,
            )
            .with_deadline(std::time::Duration::from_secs(config.task_deadline_secs)),
        );

        let dispatcher: Option<Arc<dyn TaskDispatcher>> = config.task_queue_url.as_ref().map(|url| {
            Arc::new(HttpTaskDispatcher::new(
                url.clone(),
                config.task_queue_auth_token.clone(),
            )) as Arc<dyn TaskDispatcher>
        });

        Self {
            pool,
            config,
            storage,
            documents,
            borrowers,
            pipeline,
            dispatcher,
        }
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }
}
