//! Reading and writing of volumes and of the per-view side files.
//!
//! Volumes are stored as `.npy` (single volume) or `.npz` (bundles such as the PSF
//! output). Registration, segmentation and dimension files are line oriented text:
//!
//! - `<name>.registration`: `m00: v` … `m23: v`, optionally `model:`, `minError:`,
//!   `avgError:`, `maxError:` and `z-scaling:` lines. Other lines are ignored.
//! - `<name>.beads.txt`: tab separated, one bead per line after a header, columns
//!   `ID ViewID Lx Ly Lz Wx Wy Wz Weight DescCorr RansacCorr`. Correspondence columns hold
//!   `beadId:viewId;` entries or `0` when empty.
//! - `<name>.dim`: `image width: N`, `image height: N`, `image depth: N`.

use crate::affine::AffineTransform3D;
use crate::error::{Result, SpimError};
use crate::view::{Bead, BeadLink};
use crate::volume::Volume;
use ndarray::{ArrayBase, Data, Dimension};
use ndarray_npy::{read_npy, write_npy, NpzWriter};
use csv::{ReaderBuilder, Trim, WriterBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

pub const REGISTRATION_EXTENSION: &str = "registration";
pub const SEGMENTATION_EXTENSION: &str = "beads.txt";
pub const DIMENSION_EXTENSION: &str = "dim";

const SEGMENTATION_HEADER: [&str; 11] = [
    "ID", "ViewID", "Lx", "Ly", "Lz", "Wx", "Wy", "Wz", "Weight", "DescCorr", "RansacCorr",
];

/// `<dir>/<name>.<extension>`
pub fn side_file(dir: &Path, name: &str, extension: &str) -> PathBuf {
    dir.join(format!("{name}.{extension}"))
}

/// Reads a 3D `f32` volume from an `.npy` file. Axis order is x, y, z.
pub fn read_volume(path: &Path) -> Result<Volume> {
    let data = read_npy(path).map_err(|err| SpimError::ReadVolume {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    Ok(Volume::from_array(data))
}

pub fn write_volume(path: &Path, volume: &Volume) -> Result<()> {
    write_array(path, volume.array())
}

/// Writes any `f32` array, e.g. a maximum intensity projection, to an `.npy` file.
pub fn write_array<S, D>(path: &Path, array: &ArrayBase<S, D>) -> Result<()>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    write_npy(path, array).map_err(|err| SpimError::WriteVolume {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

/// Several named arrays written into one `.npz` archive.
pub struct NpzBundle {
    path: PathBuf,
    writer: NpzWriter<File>,
}

impl NpzBundle {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|err| SpimError::io(path, err))?;
        Ok(NpzBundle {
            path: path.to_path_buf(),
            writer: NpzWriter::new(file),
        })
    }

    pub fn add<S, D>(&mut self, name: &str, array: &ArrayBase<S, D>) -> Result<()>
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        self.writer
            .add_array(name, array)
            .map_err(|err| self.write_error(err))
    }

    pub fn finish(self) -> Result<()> {
        let path = self.path;
        self.writer
            .finish()
            .map(|_| ())
            .map_err(|err| SpimError::WriteVolume {
                path,
                message: err.to_string(),
            })
    }

    fn write_error(&self, err: impl std::fmt::Display) -> SpimError {
        SpimError::WriteVolume {
            path: self.path.clone(),
            message: err.to_string(),
        }
    }
}

/// Contents of a registration file.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationRecord {
    /// Model on z-scaled coordinates, i.e. without the axial scaling of the view.
    pub transform: AffineTransform3D,
    pub model: String,
    pub min_error: Option<f64>,
    pub avg_error: Option<f64>,
    pub max_error: Option<f64>,
    pub z_scaling: Option<f64>,
}

impl RegistrationRecord {
    pub fn new(transform: AffineTransform3D) -> Self {
        RegistrationRecord {
            transform,
            model: "AffineModel3D".to_string(),
            min_error: None,
            avg_error: None,
            max_error: None,
            z_scaling: None,
        }
    }
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|err| SpimError::io(path, err))
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).map_err(|err| SpimError::io(path, err))
}

fn parse_error(kind: &'static str, path: &Path, line: usize, message: String) -> SpimError {
    SpimError::Parse {
        kind,
        path: path.to_path_buf(),
        line,
        message,
    }
}

fn parse_number<T>(kind: &'static str, path: &Path, line: usize, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|err| parse_error(kind, path, line, format!("'{}': {err}", value.trim())))
}

/// Index of `mRC` keys in row major order, `None` for the homogeneous row and other keys.
fn matrix_entry(key: &str) -> Option<usize> {
    let digits = key.strip_prefix('m')?.as_bytes();
    if digits.len() != 2 {
        return None;
    }
    let (row, col) = (digits[0].wrapping_sub(b'0'), digits[1].wrapping_sub(b'0'));
    (row < 3 && col < 4).then_some(row as usize * 4 + col as usize)
}

pub fn read_registration(path: &Path) -> Result<RegistrationRecord> {
    const KIND: &str = "registration";
    let text = read_text(path)?;
    let mut entries: [Option<f64>; 12] = [None; 12];
    let mut record = RegistrationRecord::new(AffineTransform3D::identity());

    for (i, line) in text.lines().enumerate() {
        let line_number = i + 1;
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        let key = key.trim();
        if let Some(index) = matrix_entry(key) {
            entries[index] = Some(parse_number(KIND, path, line_number, value)?);
            continue;
        }
        match key {
            "model" => record.model = value.trim().to_string(),
            "minError" => record.min_error = Some(parse_number(KIND, path, line_number, value)?),
            "avgError" => record.avg_error = Some(parse_number(KIND, path, line_number, value)?),
            "maxError" => record.max_error = Some(parse_number(KIND, path, line_number, value)?),
            "z-scaling" => record.z_scaling = Some(parse_number(KIND, path, line_number, value)?),
            _ => {}
        }
    }

    let mut values = [0.0; 12];
    for (i, entry) in entries.iter().enumerate() {
        values[i] = entry.ok_or_else(|| {
            parse_error(KIND, path, 0, format!("missing entry m{}{}", i / 4, i % 4))
        })?;
    }
    if record.model != "AffineModel3D" {
        log::warn!(
            "{path:?} holds a '{}', loading it as affine transform",
            record.model
        );
    }
    record.transform = AffineTransform3D::from_row_major(values);
    Ok(record)
}

pub fn write_registration(path: &Path, record: &RegistrationRecord) -> Result<()> {
    let mut out = String::new();
    for (i, v) in record.transform.to_row_major().iter().enumerate() {
        out.push_str(&format!("m{}{}: {v}\n", i / 4, i % 4));
    }
    out.push_str("m30: 0\nm31: 0\nm32: 0\nm33: 1\n");
    out.push_str(&format!("model: {}\n\n", record.model));
    for (key, value) in [
        ("minError", record.min_error),
        ("avgError", record.avg_error),
        ("maxError", record.max_error),
    ] {
        if let Some(value) = value {
            out.push_str(&format!("{key}: {value}\n"));
        }
    }
    if let Some(z) = record.z_scaling {
        out.push_str(&format!("\nz-scaling: {z}\n"));
    }
    write_text(path, &out)
}

fn parse_links(kind: &'static str, path: &Path, line: usize, field: &str) -> Result<Vec<BeadLink>> {
    let field = field.trim();
    if field.is_empty() || field == "0" {
        return Ok(Vec::new());
    }
    field
        .split(';')
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| {
            let (bead, view) = entry.split_once(':').ok_or_else(|| {
                parse_error(kind, path, line, format!("malformed correspondence '{entry}'"))
            })?;
            Ok(BeadLink {
                bead_id: parse_number(kind, path, line, bead)?,
                view_id: parse_number(kind, path, line, view)?,
            })
        })
        .collect()
}

/// One line of a `.beads.txt` table.
#[derive(Debug, Serialize, Deserialize)]
struct BeadRow {
    #[serde(rename = "ID")]
    id: u32,
    #[serde(rename = "ViewID")]
    view_id: u32,
    #[serde(rename = "Lx")]
    lx: f64,
    #[serde(rename = "Ly")]
    ly: f64,
    #[serde(rename = "Lz")]
    lz: f64,
    #[serde(rename = "Wx")]
    wx: f64,
    #[serde(rename = "Wy")]
    wy: f64,
    #[serde(rename = "Wz")]
    wz: f64,
    #[serde(rename = "Weight")]
    weight: f64,
    #[serde(rename = "DescCorr", default)]
    descriptor_correspondences: String,
    #[serde(rename = "RansacCorr", default)]
    ransac_correspondences: String,
}

impl BeadRow {
    fn from_bead(bead: &Bead) -> Self {
        BeadRow {
            id: bead.id,
            view_id: bead.view_id,
            lx: bead.position[0],
            ly: bead.position[1],
            lz: bead.position[2],
            wx: bead.world[0],
            wy: bead.world[1],
            wz: bead.world[2],
            weight: bead.weight,
            descriptor_correspondences: format_links(&bead.descriptor_correspondences),
            ransac_correspondences: format_links(&bead.ransac_correspondences),
        }
    }

    fn into_bead(self, kind: &'static str, path: &Path, line: usize) -> Result<Bead> {
        let mut bead = Bead::new(self.id, self.view_id, [self.lx, self.ly, self.lz]);
        bead.world = [self.wx, self.wy, self.wz];
        bead.weight = self.weight;
        bead.descriptor_correspondences =
            parse_links(kind, path, line, &self.descriptor_correspondences)?;
        bead.ransac_correspondences = parse_links(kind, path, line, &self.ransac_correspondences)?;
        Ok(bead)
    }
}

fn csv_error(kind: &'static str, path: &Path, line: usize, err: csv::Error) -> SpimError {
    let line = err.position().map_or(line, |p| p.line() as usize);
    parse_error(kind, path, line, err.to_string())
}

pub fn read_segmentation(path: &Path) -> Result<Vec<Bead>> {
    const KIND: &str = "segmentation";
    let file = File::open(path).map_err(|err| SpimError::io(path, err))?;
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(file);
    let headers = reader
        .headers()
        .map_err(|err| csv_error(KIND, path, 1, err))?
        .clone();

    let mut beads = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|err| csv_error(KIND, path, 0, err))?;
        let line = record.position().map_or(0, |p| p.line() as usize);
        let row: BeadRow = record
            .deserialize(Some(&headers))
            .map_err(|err| csv_error(KIND, path, line, err))?;
        beads.push(row.into_bead(KIND, path, line)?);
    }
    Ok(beads)
}

fn format_links(links: &[BeadLink]) -> String {
    if links.is_empty() {
        return "0".to_string();
    }
    links
        .iter()
        .map(|l| format!("{}:{};", l.bead_id, l.view_id))
        .collect()
}

pub fn write_segmentation(path: &Path, beads: &[Bead]) -> Result<()> {
    let write_error = |err: csv::Error| SpimError::WriteVolume {
        path: path.to_path_buf(),
        message: err.to_string(),
    };
    let file = File::create(path).map_err(|err| SpimError::io(path, err))?;
    let mut writer = WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(file);
    writer
        .write_record(SEGMENTATION_HEADER)
        .map_err(write_error)?;
    for bead in beads {
        writer
            .serialize(BeadRow::from_bead(bead))
            .map_err(write_error)?;
    }
    writer.flush().map_err(|err| SpimError::io(path, err))
}

pub fn read_dimensions(path: &Path) -> Result<[usize; 3]> {
    const KIND: &str = "dimension";
    let text = read_text(path)?;
    let mut dims = [None; 3];
    for (i, line) in text.lines().enumerate() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let axis = match key.trim() {
            "image width" => 0,
            "image height" => 1,
            "image depth" => 2,
            _ => continue,
        };
        dims[axis] = Some(parse_number(KIND, path, i + 1, value)?);
    }
    match dims {
        [Some(x), Some(y), Some(z)] => Ok([x, y, z]),
        _ => Err(parse_error(
            KIND,
            path,
            0,
            "width, height and depth are required".to_string(),
        )),
    }
}

pub fn write_dimensions(path: &Path, dims: [usize; 3]) -> Result<()> {
    write_text(
        path,
        &format!(
            "image width: {}\nimage height: {}\nimage depth: {}\n",
            dims[0], dims[1], dims[2]
        ),
    )
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = read_text(path)?;
    serde_json::from_str(&text).map_err(|err| {
        parse_error("json", path, err.line(), err.to_string())
    })
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).map_err(|err| SpimError::WriteVolume {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    write_text(path, &text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const REGISTRATION: &str = "m00: 0.9876\nm01: -0.1\nm02: 0.02\nm03: 104.5\n\
        m10: 0.1\nm11: 0.99\nm12: 0.0\nm13: -12.25\n\
        m20: 0.0\nm21: 0.01\nm22: 1.0\nm23: 3.0\n\
        m30: 0\nm31: 0\nm32: 0\nm33: 1\nmodel: AffineModel3D\n\n\
        minError: 0.12\navgError: 0.5\nmaxError: 1.75\n\n\
        z-scaling: 3.4956\nAngle Specific Average Error: 0.4\n\
        spim_TL1_Angle45 - Average Error: 0.33\n";

    #[test]
    fn test_read_registration_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spim_TL1_Angle0.registration");
        std::fs::write(&path, REGISTRATION).unwrap();
        let record = read_registration(&path).unwrap();
        let m = record.transform.to_row_major();
        assert_abs_diff_eq!(m[0], 0.9876);
        assert_abs_diff_eq!(m[3], 104.5);
        assert_abs_diff_eq!(m[7], -12.25);
        assert_abs_diff_eq!(m[11], 3.0);
        assert_eq!(record.z_scaling, Some(3.4956));
        assert_eq!(record.avg_error, Some(0.5));
        assert_eq!(record.model, "AffineModel3D");
    }

    #[test]
    fn test_registration_written_is_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = side_file(dir.path(), "view", REGISTRATION_EXTENSION);
        let mut record = RegistrationRecord::new(AffineTransform3D::from_row_major([
            1.0, 0.5, 0.0, 3.0, -0.5, 1.0, 0.0, 4.0, 0.0, 0.0, 1.0, 5.0,
        ]));
        record.z_scaling = Some(2.5);
        write_registration(&path, &record).unwrap();
        assert_eq!(read_registration(&path).unwrap(), record);
    }

    #[test]
    fn test_registration_without_all_entries_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.registration");
        std::fs::write(&path, "m00: 1\nm01: 0\n").unwrap();
        assert!(matches!(
            read_registration(&path),
            Err(SpimError::Parse { kind: "registration", .. })
        ));
        std::fs::write(&path, REGISTRATION.replace("104.5", "abc")).unwrap();
        assert!(matches!(
            read_registration(&path),
            Err(SpimError::Parse { line: 4, .. })
        ));
    }

    #[test]
    fn test_read_segmentation_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("view.beads.txt");
        std::fs::write(
            &path,
            "ID\tViewID\tLx\tLy\tLz\tWx\tWy\tWz\tWeight\tDescCorr\tRansacCorr\n\
             0\t2\t10.5\t20.25\t3.0\t10.5\t20.25\t10.5\t1.0\t4:3;7:5;\t4:3;\n\
             1\t2\t1.0\t2.0\t3.0\t1.0\t2.0\t10.5\t1.0\t0\t0\n",
        )
        .unwrap();
        let beads = read_segmentation(&path).unwrap();
        assert_eq!(beads.len(), 2);
        assert_eq!(beads[0].position, [10.5, 20.25, 3.0]);
        assert_eq!(beads[0].descriptor_correspondences.len(), 2);
        assert_eq!(
            beads[0].ransac_correspondences,
            vec![BeadLink {
                bead_id: 4,
                view_id: 3
            }]
        );
        assert!(beads[0].is_true_correspondence());
        assert!(!beads[1].is_true_correspondence());
        assert_eq!(beads[1].view_id, 2);
    }

    #[test]
    fn test_segmentation_written_is_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = side_file(dir.path(), "view", SEGMENTATION_EXTENSION);
        let mut bead = Bead::new(5, 1, [1.5, 2.5, 3.5]);
        bead.world = [4.0, 5.0, 6.0];
        bead.ransac_correspondences.push(BeadLink {
            bead_id: 9,
            view_id: 0,
        });
        let beads = vec![bead, Bead::new(6, 1, [0.0, 0.0, 0.0])];
        write_segmentation(&path, &beads).unwrap();
        assert_eq!(read_segmentation(&path).unwrap(), beads);
    }

    #[test]
    fn test_segmentation_without_correspondence_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("view.beads.txt");
        std::fs::write(
            &path,
            "ID\tViewID\tLx\tLy\tLz\tWx\tWy\tWz\tWeight\n\
             3\t1\t1.0\t2.0\t3.0\t1.0\t2.0\t3.0\t0.5\n",
        )
        .unwrap();
        let beads = read_segmentation(&path).unwrap();
        assert_eq!(beads.len(), 1);
        assert_eq!(beads[0].weight, 0.5);
        assert!(beads[0].descriptor_correspondences.is_empty());
        assert!(!beads[0].is_true_correspondence());
    }

    #[test]
    fn test_malformed_segmentation_reports_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("view.beads.txt");
        std::fs::write(
            &path,
            "ID\tViewID\tLx\tLy\tLz\tWx\tWy\tWz\tWeight\tDescCorr\tRansacCorr\n\
             0\t2\t1.0\t2.0\t3.0\t1.0\t2.0\t3.0\t1.0\t0\t0\n\
             1\t2\tabc\t2.0\t3.0\t1.0\t2.0\t3.0\t1.0\t0\t0\n",
        )
        .unwrap();
        assert!(matches!(
            read_segmentation(&path),
            Err(SpimError::Parse { kind: "segmentation", line: 3, .. })
        ));
        std::fs::write(
            &path,
            "ID\tViewID\tLx\tLy\tLz\tWx\tWy\tWz\tWeight\tDescCorr\tRansacCorr\n\
             0\t2\t1.0\t2.0\t3.0\t1.0\t2.0\t3.0\t1.0\t0\t4-3;\n",
        )
        .unwrap();
        assert!(matches!(
            read_segmentation(&path),
            Err(SpimError::Parse { line: 2, .. })
        ));
    }

    #[test]
    fn test_empty_segmentation_keeps_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = side_file(dir.path(), "view", SEGMENTATION_EXTENSION);
        write_segmentation(&path, &[]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, format!("{}\n", SEGMENTATION_HEADER.join("\t")));
        assert!(read_segmentation(&path).unwrap().is_empty());
    }

    #[test]
    fn test_registration_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = side_file(dir.path(), "view", REGISTRATION_EXTENSION);
        let mut record = RegistrationRecord::new(AffineTransform3D::translation(1.0, 2.0, 3.0));
        record.avg_error = Some(0.25);
        record.z_scaling = Some(2.5);
        write_registration(&path, &record).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("m00: 1\nm01: 0\nm02: 0\nm03: 1\n"));
        assert!(text.contains("m33: 1\nmodel: AffineModel3D\n\navgError: 0.25\n"));
        assert!(text.ends_with("\nz-scaling: 2.5\n"));
    }

    #[test]
    fn test_dimension_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = side_file(dir.path(), "view", DIMENSION_EXTENSION);
        write_dimensions(&path, [1024, 512, 87]).unwrap();
        assert_eq!(read_dimensions(&path).unwrap(), [1024, 512, 87]);
        std::fs::write(&path, "image width: 3\nimage height: 4\n").unwrap();
        assert!(read_dimensions(&path).is_err());
    }

    #[test]
    fn test_volume_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.npy");
        let volume = Volume::from_shape_fn([2, 3, 4], |(x, y, z)| (x * 12 + y * 4 + z) as f32);
        write_volume(&path, &volume).unwrap();
        assert_eq!(read_volume(&path).unwrap(), volume);
        assert!(matches!(
            read_volume(&dir.path().join("missing.npy")),
            Err(SpimError::ReadVolume { .. })
        ));
    }
}
