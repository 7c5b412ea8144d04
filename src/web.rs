use actix_cors::Cors;
use actix_multipart::Multipart;
use actix_web::{
    get,
    http::header::{self, ContentDisposition, DispositionParam, DispositionType},
    http::StatusCode,
    middleware::Logger,
    web, App, HttpResponse, HttpServer, Responder, ResponseError,
};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::compiler::{compile, RawParameters, PRESETS};
use crate::config::Config;
use crate::models::{build_path, Artifact, FileType, Job, JobToken};
use crate::processor::process_job;

/// The first entry is canonical, the rest are kept for older clients.
pub const CRUSH_ROUTES: [&str; 3] = ["/api/crush", "/api/grunge", "/crush"];

const VIDEO_FIELD: &str = "video";
const MAX_TEXT_FIELD_BYTES: usize = 4096;
const DOWNLOAD_NAME: &str = "crushed.mp4";

pub struct AppState {
    pub config: Config,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
enum ErrorType {
    InputMissing,
    FileTooLarge,
    MalformedRequest,
    ProcessingFailed,
    ServerError,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorType,
    description: String,
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("no file uploaded")]
    InputMissing,

    #[error("upload exceeds {limit} bytes")]
    FileTooLarge { limit: u64 },

    #[error("malformed upload: {0}")]
    MalformedRequest(String),

    #[error("staging failed: {0}")]
    Staging(#[from] io::Error),

    #[error("video processing failed")]
    ProcessingFailed,
}

impl RequestError {
    fn error_type(&self) -> ErrorType {
        match self {
            RequestError::InputMissing => ErrorType::InputMissing,
            RequestError::FileTooLarge { .. } => ErrorType::FileTooLarge,
            RequestError::MalformedRequest(_) => ErrorType::MalformedRequest,
            RequestError::Staging(_) => ErrorType::ServerError,
            RequestError::ProcessingFailed => ErrorType::ProcessingFailed,
        }
    }

    fn description(&self) -> String {
        match self {
            RequestError::InputMissing => "No file uploaded".to_owned(),
            RequestError::FileTooLarge { limit } => {
                format!("File is larger than {} MB", limit / (1024 * 1024))
            }
            RequestError::MalformedRequest(reason) => format!("Malformed upload: {reason}"),
            RequestError::Staging(_) => "Server error".to_owned(),
            RequestError::ProcessingFailed => "Video processing failed".to_owned(),
        }
    }
}

impl ResponseError for RequestError {
    fn status_code(&self) -> StatusCode {
        match self {
            RequestError::InputMissing | RequestError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            RequestError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            RequestError::Staging(_) | RequestError::ProcessingFailed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.error_type(),
            description: self.description(),
        })
    }
}

fn malformed(err: impl ToString) -> RequestError {
    RequestError::MalformedRequest(err.to_string())
}

struct Upload {
    input: Option<(Artifact, u64)>,
    parameters: RawParameters,
}

/// Streams the `video` field to `input_path` and collects every other field as a raw parameter.
async fn save_upload(
    mut payload: Multipart,
    input_path: PathBuf,
    limit: u64,
) -> Result<Upload, RequestError> {
    let mut upload = Upload {
        input: None,
        parameters: RawParameters::new(),
    };

    while let Some(item) = payload.next().await {
        let mut field = item.map_err(malformed)?;
        let name = field
            .content_disposition()
            .get_name()
            .unwrap_or_default()
            .to_owned();

        if name == VIDEO_FIELD {
            if upload.input.is_some() {
                return Err(malformed("more than one video field"));
            }

            let artifact = Artifact::new(input_path.clone());
            let mut file = fs::File::create(artifact.path()).await?;
            let mut size: u64 = 0;

            while let Some(chunk) = field.next().await {
                let bytes = chunk.map_err(malformed)?;
                size += bytes.len() as u64;

                if size > limit {
                    return Err(RequestError::FileTooLarge { limit });
                }

                file.write_all(&bytes).await?;
            }

            file.flush().await?;

            // Browsers send an empty part when no file was chosen.
            if size > 0 {
                upload.input = Some((artifact, size));
            }
        } else {
            let mut bytes = Vec::new();

            while let Some(chunk) = field.next().await {
                bytes.extend_from_slice(&chunk.map_err(malformed)?);

                if bytes.len() > MAX_TEXT_FIELD_BYTES {
                    return Err(malformed(format!("field {name} is too long")));
                }
            }

            let text = String::from_utf8(bytes)
                .map_err(|_| malformed(format!("field {name} is not UTF-8")))?;

            upload.parameters.insert(name, text);
        }
    }

    Ok(upload)
}

/// Response body that owns the job's artifacts, so both files go away once the
/// body is finished or the client disconnects.
struct Delivery {
    stream: Pin<Box<ReaderStream<fs::File>>>,
    _artifacts: (Artifact, Artifact),
}

impl Stream for Delivery {
    type Item = io::Result<web::Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

async fn crush(
    data: web::Data<AppState>,
    payload: Multipart,
) -> Result<HttpResponse, RequestError> {
    let config = &data.config;
    let token = JobToken::new();

    let upload = save_upload(
        payload,
        build_path(&config.upload_dir, &token, FileType::Input),
        config.max_upload_bytes,
    )
    .await
    .map_err(|err| {
        log::info!("[{}] rejected upload: {}", token.id, err);
        err
    })?;

    let (input, input_size) = upload.input.ok_or(RequestError::InputMissing)?;
    let parameters = compile(&upload.parameters);
    let mut job = Job::new(token, input, input_size, &config.output_dir, parameters);

    log::info!("[{}] accepted upload of {} bytes", job.id(), input_size);

    process_job(&mut job, config)
        .await
        .map_err(|_| RequestError::ProcessingFailed)?;

    let file = fs::File::open(job.output.path()).await?;

    let body = Delivery {
        stream: Box::pin(ReaderStream::new(file)),
        _artifacts: job.into_artifacts(),
    };

    Ok(HttpResponse::Ok()
        .content_type("video/mp4")
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(DOWNLOAD_NAME.to_owned())],
        })
        .streaming(body))
}

#[get("/")]
async fn index() -> impl Responder {
    "Framecrush API is running"
}

#[get("/health")]
async fn health() -> impl Responder {
    "health-ok-123"
}

#[get("/api/presets")]
async fn presets() -> impl Responder {
    web::Json(&PRESETS)
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(index)
        .service(health)
        .service(presets)
        .service(web::resource(CRUSH_ROUTES.to_vec()).route(web::post().to(crush)));
}

/// Requests without an `Origin` header are not subject to the policy.
pub fn cors_policy(allowed_origins: &HashSet<String>) -> Cors {
    let allowed_origins = allowed_origins.clone();

    Cors::default()
        .allowed_origin_fn(move |origin, _head| {
            origin
                .to_str()
                .map(|origin| allowed_origins.contains(origin))
                .unwrap_or(false)
        })
        .allowed_methods(vec!["GET", "POST", "OPTIONS"])
        .allowed_headers(vec![header::CONTENT_TYPE, header::AUTHORIZATION])
        .expose_headers(vec![header::CONTENT_DISPOSITION])
        .max_age(3600)
}

pub async fn start_web_server(config: Config) -> std::io::Result<()> {
    let bind_address = config.bind_address.clone();
    let port = config.port;
    let allowed_origins = config.allowed_origins.clone();
    let app_state = web::Data::new(AppState { config });

    log::info!("Starting web server at {bind_address}:{port}...");

    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(cors_policy(&allowed_origins))
            .wrap(Logger::new(r#"%r %s %b Origin=%{Origin}i %Dms"#))
            .configure(routes)
    })
    .bind((bind_address.as_str(), port))?
    .run()
    .await
}
