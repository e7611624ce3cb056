//! Parameter persistence.
//!
//! A parameter set is stored as one `.npy` file per named parameter, e.g.
//! `feature_conv.weight.npy`, which is also what `numpy.save` produces for the
//! tensors of a Pytorch `state_dict()`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{debug, warn};
use ndarray::ArrayD;
use ndarray_npy::{read_npy, write_npy, ReadableElement, WritableElement};

use crate::error::{ConvError, Result};
use crate::module::Parameterized;
use crate::Element;

pub type StateDict<F> = BTreeMap<String, ArrayD<F>>;

/// Copies out every trainable parameter of `module`.
pub fn state_dict<F, M>(module: &M) -> StateDict<F>
where
    F: Element,
    M: Parameterized<F> + ?Sized,
{
    module
        .parameters()
        .into_iter()
        .map(|(name, p)| (name, p.to_owned()))
        .collect()
}

/// Overwrites the parameters of `module` with the entries of `state`.
/// Every parameter must be present with a matching shape; unknown entries are ignored.
/// On error the module is left untouched.
pub fn load_state_dict<F, M>(module: &mut M, state: &StateDict<F>) -> Result<()>
where
    F: Element,
    M: Parameterized<F> + ?Sized,
{
    let params = module.parameters_mut();
    for (name, param) in &params {
        let value = state
            .get(name)
            .ok_or_else(|| ConvError::MissingParameter(name.clone()))?;
        if value.shape() != param.shape() {
            return Err(ConvError::shape_mismatch(param.shape(), value.shape()));
        }
    }
    let mut known = Vec::with_capacity(params.len());
    for (name, mut param) in params {
        if let Some(value) = state.get(&name) {
            param.assign(value);
        }
        known.push(name);
    }
    for name in state.keys().filter(|k| !known.contains(k)) {
        warn!("ignoring parameter '{}' that the module does not own", name);
    }
    Ok(())
}

/// Writes every trainable parameter to `<dir>/<name>.npy`, creating `dir` if needed.
pub fn save_parameters<F, M, P>(module: &M, dir: P) -> Result<()>
where
    F: Element + WritableElement,
    M: Parameterized<F> + ?Sized,
    P: AsRef<Path>,
{
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    for (name, param) in module.parameters() {
        write_npy(dir.join(format!("{}.npy", name)), &param)?;
    }
    debug!("saved parameters to {}", dir.display());
    Ok(())
}

/// Reads a parameter set written by [`save_parameters`] (or by `numpy.save`).
pub fn read_parameters<F, P>(dir: P) -> Result<StateDict<F>>
where
    F: Element + ReadableElement,
    P: AsRef<Path>,
{
    let mut state = StateDict::new();
    for entry in fs::read_dir(dir.as_ref())? {
        let path = entry?.path();
        if path.extension().map_or(true, |ext| ext != "npy") {
            continue;
        }
        let name = match path.file_stem().and_then(|s| s.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        let value: ArrayD<F> = read_npy(&path)?;
        state.insert(name, value);
    }
    Ok(state)
}

/// Loads `<dir>/<name>.npy` into every trainable parameter of `module`.
pub fn load_parameters<F, M, P>(module: &mut M, dir: P) -> Result<()>
where
    F: Element + ReadableElement,
    M: Parameterized<F> + ?Sized,
    P: AsRef<Path>,
{
    let state = read_parameters(dir.as_ref())?;
    load_state_dict(module, &state)?;
    debug!("loaded {} parameters from {}", state.len(), dir.as_ref().display());
    Ok(())
}
