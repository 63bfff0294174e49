//! Fiducial bead detection and channel registration for light-sheet volumes.
//!
//! A [`FiducialCloud`] turns one bead volume into a cloud of sub-pixel bead
//! centres: LoG filtering, an automatic threshold, connected-component
//! segmentation and a weighted 3D Gaussian fit per bead. A [`CloudSet`] groups
//! the clouds of several channels, matches beads across them and computes the
//! homogeneous matrix registering one channel onto another.
//!
//! ```no_run
//! use fiducialreg::{CloudSet, FiducialCloud, FiducialCloudConfig};
//! # fn main() -> fiducialreg::Result<()> {
//! let config = FiducialCloudConfig::default();
//! let set = CloudSet::new(
//!     vec![
//!         FiducialCloud::from_tiff("beads_488.tif", config)?,
//!         FiducialCloud::from_tiff("beads_560.tif", config)?,
//!     ],
//!     Some(vec![488i64.into(), 560i64.into()]),
//! )?;
//! let matrix = set.tform_named(Some(&560i64.into()), Some(&488i64.into()), "2step")?;
//! println!("{matrix}");
//! # Ok(())
//! # }
//! ```

pub mod cloud;
pub mod cloudset;
pub mod error;
pub mod filter;
pub mod fit;
pub mod io;
pub mod label;
pub mod matching;
pub mod mode;
pub mod persist;
pub mod synthetic;
pub mod threshold;

pub use cloud::{FiducialCloud, FiducialCloudConfig, Threshold};
pub use cloudset::{ChannelLabel, CloudSet, RegistrationReport};
pub use error::{RegistrationError, Result};
pub use fit::{
    CameraNoiseModel, FitError, FitStatus, GaussFitConfig, GaussFitResult, GaussFitter3D,
    LmConfig,
};
pub use matching::{MatchMethod, MatchingConfig};
pub use mode::TransformMode;
pub use persist::RegistrationFile;
