pub mod model;
pub mod normalizer;
pub mod palette;
pub mod patch_regressor;
pub mod saliency;
pub mod severity;
pub mod tensor;
pub mod utils;
