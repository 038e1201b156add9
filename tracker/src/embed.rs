use std::{
    fmt::{self, Debug, Formatter},
    fs,
    sync::Mutex,
};

use log::info;
#[cfg(test)]
use mockall::automock;
use nalgebra::{DMatrix, DVector};
use opencv::{
    core::{
        CV_32FC3, Mat, MatTraitConst, MatTraitConstManual, ModifyInplace, Scalar, Size, Vector,
        divide2_def, subtract_def, transpose_nd,
    },
    imgproc::{COLOR_BGR2RGB, INTER_LINEAR, cvt_color_def, resize},
};
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{Session, SessionInputValue},
    value::TensorRef,
};

use crate::{Device, Error, PatchGrid, Result, TrackerConfig};

/// ImageNet mean in RGB order.
const MEAN: [f64; 3] = [0.485, 0.456, 0.406];
/// ImageNet standard deviation in RGB order.
const STD: [f64; 3] = [0.229, 0.224, 0.225];
/// Lower bound of a norm before dividing, rows with a smaller norm stay (almost) zero.
const NORM_EPS: f32 = 1e-12;

/// L2-normalized patch embeddings of one image, one row per patch in row-major grid order.
#[derive(Clone, Debug, PartialEq)]
pub struct PatchEmbeddings {
    matrix: DMatrix<f32>,
}

impl PatchEmbeddings {
    /// Creates embeddings from `rows x dim` row-major `data` and normalizes every row.
    pub fn from_row_slice(rows: usize, dim: usize, data: &[f32]) -> Self {
        let mut matrix = DMatrix::from_row_slice(rows, dim, data);
        for mut row in matrix.row_iter_mut() {
            let norm = row.norm().max(NORM_EPS);
            row /= norm;
        }
        Self { matrix }
    }

    /// Number of patches.
    #[inline]
    pub fn len(&self) -> usize {
        self.matrix.nrows()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.matrix.nrows() == 0
    }

    /// Embedding dimension.
    #[inline]
    pub fn dim(&self) -> usize {
        self.matrix.ncols()
    }

    /// Copies out the embedding of the patch at `index`.
    pub fn row(&self, index: usize) -> DVector<f32> {
        self.matrix.row(index).transpose()
    }

    /// Cosine similarity of every patch to the unit-length `reference`.
    pub fn similarities(&self, reference: &DVector<f32>) -> DVector<f32> {
        &self.matrix * reference
    }
}

/// A trait for extracting per-patch embeddings from an image.
#[cfg_attr(test, automock)]
pub trait Embedder: Debug + Send {
    /// Embeds a BGR `image`.
    ///
    /// The image is resized to the working resolution when needed. Returns one normalized
    /// embedding per patch.
    fn embed(&self, image: &Mat) -> Result<PatchEmbeddings>;
}

/// Embeds every patch as its mean BGR color.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct MeanColorEmbedder {
    pub(crate) grid: PatchGrid,
}

#[cfg(test)]
impl Embedder for MeanColorEmbedder {
    fn embed(&self, image: &Mat) -> Result<PatchEmbeddings> {
        use opencv::core::{Rect, mean_def};

        let patch = self.grid.patch_size();
        let mut data = Vec::with_capacity(self.grid.len() * 3);
        for row in 0..self.grid.cols() {
            for col in 0..self.grid.cols() {
                let roi = image.roi(Rect::new(col * patch, row * patch, patch, patch))?;
                let mean = mean_def(&roi)?;
                data.extend([mean[0] as f32, mean[1] as f32, mean[2] as f32]);
            }
        }
        Ok(PatchEmbeddings::from_row_slice(self.grid.len(), 3, &data))
    }
}

/// An [`Embedder`] backed by an ONNX export of a vision transformer.
///
/// The model takes a `[1, 3, side, side]` normalized RGB tensor and outputs `[1, tokens, dim]`
/// where the last `(side / patch_size)^2` tokens are the patch tokens.
pub struct OnnxEmbedder {
    session: Mutex<Session>,
    output: String,
    grid: PatchGrid,
}

impl Debug for OnnxEmbedder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnnxEmbedder")
            .field("output", &self.output)
            .field("grid", &self.grid)
            .finish_non_exhaustive()
    }
}

impl OnnxEmbedder {
    /// Loads the model named by `config`.
    ///
    /// Fails if the model cannot be read or the runtime rejects it.
    pub fn new(config: &TrackerConfig) -> Result<Self> {
        config.validate()?;
        let model = fs::read(&config.model)
            .map_err(|err| Error::Model(format!("{}: {err}", config.model)))?;
        let session = build_session(&model, config.device)
            .map_err(|err| Error::Model(format!("{}: {err}", config.model)))?;
        let output = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| Error::Model(format!("{} has no output", config.model)))?;
        info!(
            "feature extractor {} loaded on {} with output {output}",
            config.model, config.device
        );

        Ok(Self {
            session: Mutex::new(session),
            output,
            grid: PatchGrid::new(config.side, config.patch_size),
        })
    }
}

impl Embedder for OnnxEmbedder {
    fn embed(&self, image: &Mat) -> Result<PatchEmbeddings> {
        let input = preprocess(image, self.grid.side())?;
        let mut session = self.session.lock().unwrap();
        let outputs = session.run([to_input_value(&input)?])?;
        let (dims, tokens) = outputs[self.output.as_str()].try_extract_tensor::<f32>()?;
        let dims = dims.iter().map(|&dim| dim as usize).collect::<Vec<_>>();

        from_tokens(&dims, tokens, self.grid.len())
    }
}

/// Keeps the trailing `patches` tokens of the first batch and normalizes them.
///
/// Leading tokens (class and register tokens) are discarded.
fn from_tokens(dims: &[usize], tokens: &[f32], patches: usize) -> Result<PatchEmbeddings> {
    let &[_, count, dim] = dims else {
        return Err(Error::Embedding(format!(
            "expected shape [batch, tokens, dim], got {dims:?}"
        )));
    };
    if count < patches || tokens.len() < count * dim {
        return Err(Error::Embedding(format!(
            "{count} tokens cannot cover {patches} patches"
        )));
    }

    let skip = count - patches;
    Ok(PatchEmbeddings::from_row_slice(
        patches,
        dim,
        &tokens[skip * dim..count * dim],
    ))
}

/// Preprocesses a BGR `Mat` image to a normalized and resized RGB `Mat` image with type `f32`.
#[inline]
fn preprocess(mat: &impl MatTraitConst, side: i32) -> Result<Mat> {
    let mut mat = mat.try_clone()?;
    let size = Size::new(side, side);

    // SAFETY: all of the functions below can be called in place.
    unsafe {
        if mat.size()? != size {
            mat.modify_inplace(|mat, mat_mut| resize(mat, mat_mut, size, 0.0, 0.0, INTER_LINEAR))?;
        }
        mat.modify_inplace(|mat, mat_mut| cvt_color_def(mat, mat_mut, COLOR_BGR2RGB))?;
        mat.modify_inplace(|mat, mat_mut| mat.convert_to(mat_mut, CV_32FC3, 1.0 / 255.0, 0.0))?;
        mat.modify_inplace(|mat, mat_mut| {
            subtract_def(mat, &Scalar::new(MEAN[0], MEAN[1], MEAN[2], 0.0), mat_mut)
        })?;
        mat.modify_inplace(|mat, mat_mut| {
            divide2_def(mat, &Scalar::new(STD[0], STD[1], STD[2], 1.0), mat_mut)
        })?;
    }
    Ok(mat)
}

/// Packs the output of [`preprocess`] into a `[1, 3, H, W]` model input.
#[inline]
fn to_input_value(mat: &impl MatTraitConst) -> Result<SessionInputValue<'_>> {
    let mat = mat.reshape_nd(1, &[1, mat.rows(), mat.cols(), 3])?;
    let mut mat_t = Mat::default();
    transpose_nd(&mat, &Vector::from_slice(&[0, 3, 1, 2]), &mut mat_t)?;
    let shape = mat_t.mat_size();
    let input = (shape.as_slice(), mat_t.data_typed::<f32>()?);
    let tensor = TensorRef::from_array_view(input)?;
    Ok(SessionInputValue::Owned(tensor.clone().into_dyn()))
}

#[inline]
fn build_session(model: &[u8], device: Device) -> ort::Result<Session> {
    match device {
        Device::Cuda => Session::builder()?
            .with_execution_providers([CUDAExecutionProvider::default().build()])?
            .commit_from_memory(model),
        Device::Cpu => Session::builder()?.commit_from_memory(model),
    }
}

#[cfg(test)]
mod tests {
    use opencv::core::{CV_8UC3, Vec3b, Vec3f};

    use super::*;

    #[test]
    fn rows_are_unit_length() {
        let data = (0..6 * 5)
            .map(|i| ((i * 7) % 11) as f32 - 4.5)
            .collect::<Vec<_>>();
        let embeddings = PatchEmbeddings::from_row_slice(6, 5, &data);

        assert_eq!(embeddings.len(), 6);
        assert_eq!(embeddings.dim(), 5);
        for i in 0..embeddings.len() {
            assert!((embeddings.row(i).norm() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn zero_row_stays_zero() {
        let embeddings = PatchEmbeddings::from_row_slice(2, 3, &[0.0, 0.0, 0.0, 3.0, 0.0, 4.0]);

        assert_eq!(embeddings.row(0).norm(), 0.0);
        assert!(embeddings.row(0).iter().all(|value| value.is_finite()));
        assert!((embeddings.row(1)[2] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn similarities_are_cosine() {
        let embeddings = PatchEmbeddings::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 2.0, 1.0, 1.0]);
        let reference = embeddings.row(0);
        let similarities = embeddings.similarities(&reference);

        assert!((similarities[0] - 1.0).abs() < 1e-6);
        assert!(similarities[1].abs() < 1e-6);
        assert!((similarities[2] - 0.5_f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn from_tokens_drops_leading_tokens() {
        // one class token followed by four patch tokens of dim 2
        let tokens = [9.0, 9.0, 1.0, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 3.0];
        let embeddings = from_tokens(&[1, 5, 2], &tokens, 4).unwrap();

        assert_eq!(embeddings.len(), 4);
        assert_eq!(embeddings.row(0).as_slice(), &[1.0, 0.0]);
        assert_eq!(embeddings.row(3).as_slice(), &[0.0, 1.0]);
    }

    #[test]
    fn from_tokens_rejects_short_output() {
        assert!(matches!(
            from_tokens(&[1, 3, 2], &[0.0; 6], 4),
            Err(Error::Embedding(_))
        ));
        assert!(matches!(
            from_tokens(&[3, 2], &[0.0; 6], 3),
            Err(Error::Embedding(_))
        ));
    }

    #[test]
    fn preprocess_resizes_and_normalizes() {
        let mat = Mat::new_rows_cols_with_default(2, 2, CV_8UC3, Scalar::new(255.0, 0.0, 0.0, 0.0))
            .unwrap();
        let input = preprocess(&mat, 4).unwrap();

        assert_eq!(input.size().unwrap(), Size::new(4, 4));
        assert_eq!(input.typ(), CV_32FC3);
        let pixel = *input.at_2d::<Vec3f>(3, 3).unwrap();
        assert!((pixel[0] - (0.0 - 0.485) / 0.229).abs() < 1e-4);
        assert!((pixel[1] - (0.0 - 0.456) / 0.224).abs() < 1e-4);
        assert!((pixel[2] - (1.0 - 0.406) / 0.225).abs() < 1e-4);
        assert_eq!(*mat.at_2d::<Vec3b>(0, 0).unwrap(), Vec3b::from([255, 0, 0]));
    }
}
