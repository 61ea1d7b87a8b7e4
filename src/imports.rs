//! Module for crate-local imports to reduce boilerplate in submodules

#![allow(unused_imports)]

pub(crate) use crate::error::Error;
pub(crate) use crate::traits::*;
pub(crate) use crate::utils;
pub(crate) use crate::utils::{almost_eq, find_nearest_index, is_sorted, trapz};

pub(crate) use anyhow::{anyhow, bail, ensure, Context};
pub(crate) use ndarray::prelude::*;
pub(crate) use num_dual::{Dual64, DualNum, HyperDual64};
pub(crate) use serde::{Deserialize, Serialize};
pub(crate) use std::collections::HashMap;
pub(crate) use std::f64::consts::PI;
pub(crate) use std::ffi::OsStr;
pub(crate) use std::fmt;
pub(crate) use std::fs::File;
pub(crate) use std::path::{Path, PathBuf};
pub(crate) use std::sync::Arc;
