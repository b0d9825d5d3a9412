use async_trait::async_trait;
use facer_core::{
    preprocess, Embedding, EmbeddingExtractor, InferenceRuntime, PreprocessError, PreprocessOptions,
    RawImageRegion, RecognizerError,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("preprocess error: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Turns a detected face into a unit-length embedding.
#[async_trait]
pub trait FaceEmbedder: Send + Sync {
    async fn embed(&self, region: RawImageRegion) -> Result<Embedding, EngineError>;
}

/// Messages sent from callers to the engine thread.
struct EmbedRequest {
    region: RawImageRegion,
    reply: oneshot::Sender<Result<Embedding, EngineError>>,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EmbedRequest>,
}

#[async_trait]
impl FaceEmbedder for EngineHandle {
    /// Request an embedding: preprocess the region, run the model, normalize.
    async fn embed(&self, region: RawImageRegion) -> Result<Embedding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EmbedRequest {
                region,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The extractor is moved into the thread untouched; the model itself is
/// loaded by the first request, so startup never blocks on the model file.
/// The thread exits once every [`EngineHandle`] is dropped.
pub fn spawn_engine<R>(
    mut extractor: EmbeddingExtractor<R>,
    options: PreprocessOptions,
) -> Result<EngineHandle, EngineError>
where
    R: InferenceRuntime + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EmbedRequest>(4);

    std::thread::Builder::new()
        .name("facer-engine".into())
        .spawn(move || {
            tracing::info!(size = options.size, pad = options.pad_ratio, "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                let result = run_embed(&mut extractor, &req.region, &options);
                if let Err(e) = &result {
                    tracing::debug!(error = %e, "embed request failed");
                }
                let _ = req.reply.send(result);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_embed<R: InferenceRuntime>(
    extractor: &mut EmbeddingExtractor<R>,
    region: &RawImageRegion,
    options: &PreprocessOptions,
) -> Result<Embedding, EngineError> {
    let tensor = preprocess(region, options)?;
    let embedding = extractor.embed(&tensor)?;
    tracing::debug!(dim = embedding.dim(), "embedding extracted");
    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use facer_core::{BoundingBox, InputTensor};
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Echoes the mean of each channel, padded to the requested width.
    struct MeanRuntime {
        dim: usize,
    }

    impl InferenceRuntime for MeanRuntime {
        fn infer(&mut self, input: &InputTensor) -> Result<Vec<f32>, RecognizerError> {
            let data = input.as_slice();
            let mut sums = [0.0f32; 3];
            for (i, v) in data.iter().enumerate() {
                sums[i % 3] += v;
            }
            let n = (data.len() / 3) as f32;
            let mut out: Vec<f32> = sums.iter().map(|s| s / n).collect();
            out.resize(self.dim, 0.25);
            Ok(out)
        }
    }

    fn region(rgb: [u8; 3]) -> RawImageRegion {
        RawImageRegion::new(
            RgbImage::from_pixel(64, 48, Rgb(rgb)),
            BoundingBox { x: 16.0, y: 8.0, width: 30.0, height: 32.0 },
        )
    }

    fn small() -> PreprocessOptions {
        PreprocessOptions { size: 16, pad_ratio: 0.25 }
    }

    #[tokio::test]
    async fn test_embed_through_thread() {
        let extractor = EmbeddingExtractor::new(|| Ok(MeanRuntime { dim: 8 })).with_expected_dim(Some(8));
        let engine = spawn_engine(extractor, small()).unwrap();

        let a = engine.embed(region([200, 30, 30])).await.unwrap();
        let b = engine.clone().embed(region([200, 30, 30])).await.unwrap();
        let c = engine.embed(region([30, 30, 200])).await.unwrap();

        assert_eq!(a.dim(), 8);
        assert!((a.norm() - 1.0).abs() < 1e-4);
        assert!((a.similarity(&b).unwrap() - 1.0).abs() < 1e-5);
        assert!(a.similarity(&c).unwrap() < 0.99);
    }

    #[tokio::test]
    async fn test_invalid_region_reported() {
        let extractor = EmbeddingExtractor::new(|| Ok(MeanRuntime { dim: 128 }));
        let engine = spawn_engine(extractor, small()).unwrap();
        let bad = RawImageRegion::new(RgbImage::new(0, 0), BoundingBox { x: 0.0, y: 0.0, width: 4.0, height: 4.0 });
        assert!(matches!(
            engine.embed(bad).await,
            Err(EngineError::Preprocess(PreprocessError::InvalidRegion(_)))
        ));
    }

    #[tokio::test]
    async fn test_model_failure_cached_across_requests() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let extractor = EmbeddingExtractor::<MeanRuntime>::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(RecognizerError::ModelUnavailable("face_embedder.onnx missing".into()))
        });
        let engine = spawn_engine(extractor, small()).unwrap();

        for _ in 0..3 {
            assert!(matches!(
                engine.embed(region([1, 2, 3])).await,
                Err(EngineError::Recognizer(RecognizerError::ModelUnavailable(_)))
            ));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
