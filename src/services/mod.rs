pub mod engine;
pub mod executor;
pub mod generation;
pub mod quality;
pub mod segmenter;
pub mod stages;
pub mod stitcher;
pub mod store;
pub mod workflow;
