//! Per-job object-storage artifacts.
//!
//! Before submission the control plane writes a config artifact the
//! containerized pipeline reads; after termination it harvests the job's
//! log artifact (external id, exit code) and its declared-products
//! manifest. The control plane records declared outputs into the registry
//! without interpreting pixel content.
//!
//! Key layout groups everything by processing date:
//! `{proc_date}/{job_name}_jid{jid}_cfg.ini`, `..._log.txt`,
//! `..._products.json`.

use crate::selector::CoaddInput;
use serde::{Deserialize, Serialize};

pub fn job_name(base: &str, proc_date: &str, jid: i64) -> String {
    format!("{base}_{proc_date}_jid{jid}")
}

pub fn config_key(proc_date: &str, name: &str) -> String {
    format!("{proc_date}/{name}_cfg.ini")
}

pub fn log_key(proc_date: &str, name: &str) -> String {
    format!("{proc_date}/{name}_log.txt")
}

pub fn products_key(proc_date: &str, name: &str) -> String {
    format!("{proc_date}/{name}_products.json")
}

/// Parse the jid out of a log-artifact key of the form
/// `{proc_date}/{name}_jid{N}_log.txt`.
pub fn jid_from_log_key(key: &str) -> Option<i64> {
    let file = key.rsplit('/').next()?;
    let stem = file.strip_suffix("_log.txt")?;
    let (_, jid_part) = stem.rsplit_once("_jid")?;
    jid_part.parse().ok()
}

/// What a job's log artifact declares about its run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobLogSummary {
    pub external_id: Option<String>,
    pub exit_code: Option<i32>,
}

/// Scan a log artifact for the `external_job_id = ...` and
/// `terminating_exitcode = ...` lines the pipeline container emits.
pub fn parse_job_log(text: &str) -> JobLogSummary {
    let mut summary = JobLogSummary::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "external_job_id" => summary.external_id = Some(value.to_string()),
            "terminating_exitcode" => summary.exit_code = value.parse().ok(),
            _ => {}
        }
    }
    summary
}

/// Render the config artifact a science job consumes: the provisional
/// reference image (or the coadd input list to build one) and the product
/// output location.
pub fn render_science_config(
    proc_date: &str,
    jid: i64,
    field: i64,
    fid: i16,
    ref_image: Option<(&str, i64)>,
    coadd_inputs: &[CoaddInput],
    product_bucket: &str,
) -> String {
    let mut out = String::new();
    out.push_str("[JOB]\n");
    out.push_str(&format!("jid = {jid}\n"));
    out.push_str(&format!("proc_date = {proc_date}\n"));
    out.push_str(&format!("field = {field}\n"));
    out.push_str(&format!("fid = {fid}\n"));
    out.push_str(&format!("product_bucket = {product_bucket}\n"));

    match ref_image {
        Some((filename, rfid)) => {
            out.push_str("\n[REFIMAGE]\n");
            out.push_str(&format!("rfid = {rfid}\n"));
            out.push_str(&format!("filename = {filename}\n"));
        }
        None => {
            out.push_str("\n[REFIMAGE_INPUTS]\n");
            out.push_str(&format!("count = {}\n", coadd_inputs.len()));
            for (i, input) in coadd_inputs.iter().enumerate() {
                out.push_str(&format!(
                    "input{i} = {},{},{:.6}\n",
                    input.rid, input.filename, input.separation_deg
                ));
            }
        }
    }
    out
}

/// Declared outputs of a finished job, written by the pipeline container
/// as a JSON manifest.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeclaredProducts {
    #[serde(default)]
    pub ref_image: Option<DeclaredRefImage>,
    #[serde(default)]
    pub diff_image: Option<DeclaredDiffImage>,
}

/// A coadded reference image built by the job, completing the provisional
/// row registered at launch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeclaredRefImage {
    pub rfid: i64,
    pub version: i32,
    pub filename: String,
    pub checksum: String,
    pub nframes: i32,
    pub mjdobsmin: f64,
    pub mjdobsmax: f64,
    pub cov5percent: f64,
    pub fwhmmin: f64,
    pub fwhmmedian: f64,
    pub fwhmmax: f64,
}

/// A difference image produced by the job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeclaredDiffImage {
    pub rid: i64,
    pub rfid: i64,
    pub filename: String,
    pub checksum: String,
    pub ra1: f64,
    pub dec1: f64,
    pub ra2: f64,
    pub dec2: f64,
    pub ra3: f64,
    pub dec3: f64,
    pub ra4: f64,
    pub dec4: f64,
}
