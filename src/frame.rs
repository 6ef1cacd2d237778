use crate::detection::PixelBox;
use ndarray::{Array, Ix4};
use opencv::{
    core::{self, Mat, Point, Rect, Scalar, Size, Vector},
    imgcodecs, imgproc,
    prelude::*,
};
use thiserror::Error;

/// BGR red used for detection rectangles.
pub const BOX_COLOR: (f64, f64, f64) = (0.0, 0.0, 255.0);
pub const BOX_THICKNESS: i32 = 5;

const LABEL_BACKGROUND: (f64, f64, f64) = (255.0, 0.0, 255.0);
const LABEL_TEXT: (f64, f64, f64) = (255.0, 255.0, 255.0);
const LABEL_SCALE: f64 = 1.5;
const LABEL_THICKNESS: i32 = 2;
const LABEL_PADDING: i32 = 10;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Failed to resize frame: {0}")]
    ResizeFailed(opencv::Error),
    #[error("Failed to encode frame: {0}")]
    EncodeFrameFailed(opencv::Error),
    #[error("Frame has no pixel data")]
    EmptyFrame,
    #[error("Expected a 3-channel BGR frame, got {0} channels")]
    UnsupportedChannels(i32),
    #[error("OpenCV error: {0}")]
    OpenCvError(#[from] opencv::Error),
}

fn scalar(color: (f64, f64, f64)) -> Scalar {
    Scalar::new(color.0, color.1, color.2, 0.0)
}

/// A decoded BGR image owned by whoever is processing it.
#[derive(Debug)]
pub struct Frame {
    mat: Mat,
}

impl Frame {
    pub fn from_mat(mat: Mat) -> Self {
        Self { mat }
    }

    /// A black frame of the given size.
    pub fn blank(width: i32, height: i32) -> Result<Self, FrameError> {
        let mat =
            Mat::new_rows_cols_with_default(height, width, core::CV_8UC3, Scalar::all(0.0))?;
        Ok(Self { mat })
    }

    pub fn width(&self) -> i32 {
        self.mat.cols()
    }

    pub fn height(&self) -> i32 {
        self.mat.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.mat.empty()
    }

    pub fn resized(&self, width: i32, height: i32) -> Result<Frame, FrameError> {
        if self.is_empty() {
            return Err(FrameError::EmptyFrame);
        }
        let mut resized = Mat::default();
        imgproc::resize(
            &self.mat,
            &mut resized,
            Size::new(width, height),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )
        .map_err(FrameError::ResizeFailed)?;
        Ok(Frame { mat: resized })
    }

    pub fn draw_box(
        &mut self,
        bbox: &PixelBox,
        color: (f64, f64, f64),
        thickness: i32,
    ) -> Result<&mut Self, FrameError> {
        imgproc::rectangle(
            &mut self.mat,
            Rect::new(bbox.x1, bbox.y1, bbox.x2 - bbox.x1, bbox.y2 - bbox.y1),
            scalar(color),
            thickness,
            imgproc::LINE_8,
            0,
        )?;
        Ok(self)
    }

    /// Draws `text` on a filled background box. `origin` is the bottom-left
    /// corner of the text baseline.
    pub fn draw_label(&mut self, text: &str, origin: Point) -> Result<&mut Self, FrameError> {
        let mut baseline = 0;
        let text_size = imgproc::get_text_size(
            text,
            imgproc::FONT_HERSHEY_PLAIN,
            LABEL_SCALE,
            LABEL_THICKNESS,
            &mut baseline,
        )?;

        let top_left = Point::new(
            origin.x - LABEL_PADDING,
            origin.y - text_size.height - LABEL_PADDING,
        );
        let bottom_right = Point::new(
            origin.x + text_size.width + LABEL_PADDING,
            origin.y + LABEL_PADDING,
        );
        imgproc::rectangle_points(
            &mut self.mat,
            top_left,
            bottom_right,
            scalar(LABEL_BACKGROUND),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )?;

        imgproc::put_text(
            &mut self.mat,
            text,
            origin,
            imgproc::FONT_HERSHEY_PLAIN,
            LABEL_SCALE,
            scalar(LABEL_TEXT),
            LABEL_THICKNESS,
            imgproc::LINE_AA,
            false,
        )?;
        Ok(self)
    }

    pub fn to_jpg(&self) -> Result<Vec<u8>, FrameError> {
        let mut buf = Vector::<u8>::new();
        imgcodecs::imencode(".jpg", &self.mat, &mut buf, &Vector::new())
            .map_err(FrameError::EncodeFrameFailed)?;
        Ok(buf.into())
    }

    /// Square-resizes the frame and lays it out as a normalized RGB NCHW
    /// tensor, as expected by YOLO exports.
    pub fn to_rgb_tensor(&self, size: u32) -> Result<Array<f32, Ix4>, FrameError> {
        let side = size as usize;
        if self.mat.channels() != 3 {
            return Err(FrameError::UnsupportedChannels(self.mat.channels()));
        }
        let resized = self.resized(size as i32, size as i32)?;
        let continuous = if resized.mat.is_continuous() {
            resized.mat
        } else {
            resized.mat.try_clone()?
        };
        let data = continuous.data_bytes()?;

        let mut input = Array::zeros((1, 3, side, side));
        for (index, pixel) in data.chunks_exact(3).enumerate() {
            let y = index / side;
            let x = index % side;
            let [b, g, r] = [pixel[0], pixel[1], pixel[2]];
            input[[0, 0, y, x]] = (r as f32) / 255.;
            input[[0, 1, y, x]] = (g as f32) / 255.;
            input[[0, 2, y, x]] = (b as f32) / 255.;
        }

        Ok(input)
    }
}
