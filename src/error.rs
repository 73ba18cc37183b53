use crate::{
    accumulate::AccumulateError, basis::BasisError, config::ConfigError, dataset::DatasetError,
    fm::FmError, geometry::GeometryError, models::ModelError, perturb::PerturbError,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error in the `config` module")]
    Config(#[from] ConfigError),
    #[error("Error in the `geometry` module")]
    Geometry(#[from] GeometryError),
    #[error("Error in the `models` module")]
    Model(#[from] ModelError),
    #[error("Error in the `perturb` module")]
    Perturb(#[from] PerturbError),
    #[error("Error in the `accumulate` module")]
    Accumulate(#[from] AccumulateError),
    #[error("Error in the `basis` module")]
    Basis(#[from] BasisError),
    #[error("Error in the `dataset` module")]
    Dataset(#[from] DatasetError),
    #[error("Error in the `fm` module")]
    Fm(#[from] FmError),
}
pub type Result<T> = std::result::Result<T, Error>;
