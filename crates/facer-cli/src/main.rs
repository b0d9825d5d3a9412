use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use facer_attendance::{
    attendance_status, roster, save_session, spawn_engine, AttendanceOutcome, AttendanceWorkflow,
    DocumentStore, FixedLocation, Session, SqliteStore,
};
use facer_core::{BoundingBox, EmbeddingExtractor, GeoPoint, GeofenceSpec, RawImageRegion};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "facer", about = "Face-verified attendance CLI")]
struct Cli {
    /// Config file (default: $FACER_CONFIG or ~/.config/facer/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// A face in an image file, as reported by a face detector.
#[derive(Args)]
struct FaceArgs {
    /// Image file containing the face
    #[arg(long)]
    image: PathBuf,
    /// Detector bounding box as x,y,w,h in pixels
    #[arg(long, value_parser = parse_bbox)]
    bbox: BoundingBox,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update a session, optionally with a geofence
    SeedSession {
        #[arg(long)]
        session: String,
        #[arg(long)]
        course: String,
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long, default_value = facer_attendance::session::DEFAULT_METHOD)]
        method: String,
        /// Geofence center as lat,lng
        #[arg(long, value_parser = parse_point)]
        center: Option<GeoPoint>,
        /// Geofence radius in metres (default from config)
        #[arg(long, requires = "center")]
        radius: Option<f64>,
    },
    /// Enroll (or re-enroll) a user's face template
    Enroll {
        #[arg(long)]
        user: String,
        #[command(flatten)]
        face: FaceArgs,
    },
    /// Verify a face and record attendance
    Verify {
        #[arg(long)]
        user: String,
        #[arg(long)]
        session: String,
        #[command(flatten)]
        face: FaceArgs,
        /// Current device location as lat,lng
        #[arg(long, value_parser = parse_point)]
        location: Option<GeoPoint>,
    },
    /// Show a user's attendance record for a session
    Status {
        #[arg(long)]
        user: String,
        #[arg(long)]
        session: String,
    },
    /// List all attendance records for a session
    Roster {
        #[arg(long)]
        session: String,
    },
    /// Haversine distance between two lat,lng points
    Distance {
        #[arg(value_parser = parse_point)]
        from: GeoPoint,
        #[arg(value_parser = parse_point)]
        to: GeoPoint,
        /// Also report whether `from` lies within this radius of `to`
        #[arg(long)]
        radius: Option<f64>,
    },
}

fn parse_floats<const N: usize>(s: &str) -> Result<[f64; N], String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.len() != N {
        return Err(format!("expected {N} comma-separated numbers, got {s:?}"));
    }
    let mut out = [0.0; N];
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = part.parse().map_err(|e| format!("{part:?}: {e}"))?;
    }
    Ok(out)
}

fn parse_bbox(s: &str) -> Result<BoundingBox, String> {
    let [x, y, width, height] = parse_floats::<4>(s)?;
    Ok(BoundingBox {
        x: x as f32,
        y: y as f32,
        width: width as f32,
        height: height as f32,
    })
}

fn parse_point(s: &str) -> Result<GeoPoint, String> {
    let [lat, lng] = parse_floats::<2>(s)?;
    let point = GeoPoint::new(lat, lng);
    point.validate().map_err(|e| e.to_string())?;
    Ok(point)
}

fn load_region(face: &FaceArgs) -> Result<RawImageRegion> {
    let image = image::open(&face.image)
        .with_context(|| format!("opening image {}", face.image.display()))?
        .to_rgb8();
    tracing::debug!(
        path = %face.image.display(),
        width = image.width(),
        height = image.height(),
        bbox = ?face.bbox,
        "loaded face image"
    );
    Ok(RawImageRegion::new(image, face.bbox))
}

async fn open_store(cfg: &Config) -> Result<Arc<dyn DocumentStore>> {
    let store = SqliteStore::open(&cfg.db_path)
        .await
        .with_context(|| format!("opening store {}", cfg.db_path.display()))?;
    Ok(Arc::new(store))
}

fn build_workflow(
    cfg: &Config,
    store: Arc<dyn DocumentStore>,
    location: FixedLocation,
) -> Result<AttendanceWorkflow> {
    let extractor = EmbeddingExtractor::onnx(cfg.model_path.clone(), cfg.intra_threads)
        .with_expected_dim(cfg.expected_dim());
    let engine = spawn_engine(extractor, cfg.preprocess_options())?;
    Ok(AttendanceWorkflow::new(
        store,
        Arc::new(engine),
        Arc::new(location),
        cfg.workflow_settings(),
    ))
}

fn exit_code(outcome: &AttendanceOutcome) -> ExitCode {
    match outcome {
        AttendanceOutcome::MatchedAndPresent { .. } => ExitCode::SUCCESS,
        AttendanceOutcome::NotMatched { .. } | AttendanceOutcome::MatchedOutsideGeofence { .. } => {
            ExitCode::from(2)
        }
        AttendanceOutcome::NoEnrollment | AttendanceOutcome::NoSession => ExitCode::from(3),
        AttendanceOutcome::TransientFailure(_) => ExitCode::from(1),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref())?;
    tracing::debug!(?cfg, "configuration");

    match cli.command {
        Commands::SeedSession {
            session,
            course,
            title,
            method,
            center,
            radius,
        } => {
            let mut s = Session::new(session, course);
            s.title = title;
            s.method = method;
            if let Some(center) = center {
                let radius = radius.unwrap_or(cfg.default_radius_m);
                GeofenceSpec::new(center, radius)?;
                s = s.with_geofence(center, radius);
            }
            let store = open_store(&cfg).await?;
            save_session(store.as_ref(), &s).await?;
            println!("Session {} saved", s.id);
        }
        Commands::Enroll { user, face } => {
            let region = load_region(&face)?;
            let store = open_store(&cfg).await?;
            let workflow = build_workflow(&cfg, store, FixedLocation::unavailable())?;
            let embedding = workflow.enroll(&user, region).await?;
            println!("Enrolled {user} ({}-dim template)", embedding.dim());
        }
        Commands::Verify {
            user,
            session,
            face,
            location,
        } => {
            let region = load_region(&face)?;
            let store = open_store(&cfg).await?;
            let workflow = build_workflow(&cfg, store, FixedLocation(location))?;
            let outcome = workflow.verify(&user, &session, region).await;
            println!("{outcome}");
            if outcome.is_retryable() {
                println!("Re-capture and try again.");
            }
            return Ok(exit_code(&outcome));
        }
        Commands::Status { user, session } => {
            let store = open_store(&cfg).await?;
            match attendance_status(store.as_ref(), &session, &user).await? {
                Some(r) => println!(
                    "{}: {} via {} at {}",
                    r.user_id,
                    r.status,
                    r.method,
                    r.timestamp.as_deref().unwrap_or("-")
                ),
                None => println!("No record found."),
            }
        }
        Commands::Roster { session } => {
            let store = open_store(&cfg).await?;
            let records = roster(store.as_ref(), &session).await?;
            if records.is_empty() {
                println!("No attendance recorded for {session}");
            }
            for r in records {
                println!(
                    "{}\t{}\t{}\t{}",
                    r.user_id,
                    r.status,
                    r.method,
                    r.timestamp.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Distance { from, to, radius } => {
            let d = facer_core::distance_meters(&from, &to)?;
            match radius {
                Some(r) => println!("{d:.1} m ({})", if d <= r { "inside" } else { "outside" }),
                None => println!("{d:.1} m"),
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
