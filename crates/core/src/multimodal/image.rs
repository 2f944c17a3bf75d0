//! Image acquisition: a URL is fetched over HTTP, anything else is read from
//! disk. Either way the bytes are decoded to RGB.

use std::path::PathBuf;

use image::RgbImage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageAcquisitionError {
    #[error("failed to fetch image from {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("image request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("failed to read image file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Url(String),
    Path(PathBuf),
}

impl ImageSource {
    /// `http://` and `https://` are remote; every other string is a path.
    pub fn parse(source: &str) -> Self {
        if source.starts_with("http://") || source.starts_with("https://") {
            Self::Url(source.to_string())
        } else {
            Self::Path(PathBuf::from(source))
        }
    }

    fn read_bytes(&self) -> Result<Vec<u8>, ImageAcquisitionError> {
        match self {
            Self::Url(url) => {
                tracing::debug!(%url, "fetching image");
                let fetch_err = |source| ImageAcquisitionError::Fetch {
                    url: url.clone(),
                    source,
                };
                let response = reqwest::blocking::get(url).map_err(fetch_err)?;
                let status = response.status();
                if !status.is_success() {
                    return Err(ImageAcquisitionError::Status {
                        url: url.clone(),
                        status: status.as_u16(),
                    });
                }
                Ok(response.bytes().map_err(fetch_err)?.to_vec())
            }
            Self::Path(path) => std::fs::read(path).map_err(|source| ImageAcquisitionError::Read {
                path: path.clone(),
                source,
            }),
        }
    }
}

/// Fetch or read `source` and decode it to RGB.
pub fn load_image(source: &str) -> Result<RgbImage, ImageAcquisitionError> {
    let bytes = ImageSource::parse(source).read_bytes()?;
    let image = image::load_from_memory(&bytes)?.to_rgb8();
    tracing::debug!(width = image.width(), height = image.height(), "decoded image");
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn source_classification() {
        assert_eq!(
            ImageSource::parse("https://example.com/a.jpg"),
            ImageSource::Url("https://example.com/a.jpg".into())
        );
        assert!(matches!(
            ImageSource::parse("http://localhost/a.png"),
            ImageSource::Url(_)
        ));
        assert_eq!(
            ImageSource::parse("images/cat.png"),
            ImageSource::Path(PathBuf::from("images/cat.png"))
        );
        // scheme match is literal
        assert!(matches!(ImageSource::parse("ftp://x/y.png"), ImageSource::Path(_)));
    }

    #[test]
    fn local_png_round_trips_to_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("red.png");
        RgbImage::from_pixel(5, 3, Rgb([255, 0, 0])).save(&path).unwrap();

        let img = load_image(path.to_str().unwrap()).unwrap();
        assert_eq!(img.dimensions(), (5, 3));
        assert_eq!(img.get_pixel(2, 1), &Rgb([255, 0, 0]));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load_image("/definitely/not/here.png").unwrap_err();
        assert!(matches!(err, ImageAcquisitionError::Read { .. }));
        assert!(err.to_string().contains("/definitely/not/here.png"));
    }

    #[test]
    fn garbage_bytes_are_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.png");
        std::fs::write(&path, b"not an image").unwrap();
        assert!(matches!(
            load_image(path.to_str().unwrap()),
            Err(ImageAcquisitionError::Decode(_))
        ));
    }
}
