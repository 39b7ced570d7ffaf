//! Plain-text formats exchanged with the renderer and the operator.
//!
//! All files are whitespace separated. Point files hold `x y` integer pairs,
//! mesh files hold one vertex per line (`x y z u v`, three lines per
//! triangle) and rectangle files hold `min_x min_y max_x max_y` per line.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::Rect2;

#[derive(thiserror::Error, Debug)]
pub enum FormatError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: cannot parse `{token}`")]
    Parse {
        path: PathBuf,
        line: usize,
        token: String,
    },
    #[error("{path}: {found} values is not a multiple of {group}")]
    Truncated {
        path: PathBuf,
        group: usize,
        found: usize,
    },
}

impl FormatError {
    /// True when the file itself could not be opened.
    pub fn is_missing(&self) -> bool {
        matches!(
            self,
            FormatError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}

/// One textured mesh vertex.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub tex: [f32; 2],
}

impl MeshVertex {
    pub fn new(position: [f32; 3], tex: [f32; 2]) -> Self {
        Self { position, tex }
    }

    /// Interleaved `[x, y, z, u, v]`, the layout the renderer uploads.
    pub fn to_array(&self) -> [f32; 5] {
        [
            self.position[0],
            self.position[1],
            self.position[2],
            self.tex[0],
            self.tex[1],
        ]
    }
}

fn read_text(path: &Path) -> Result<String, FormatError> {
    fs::read_to_string(path).map_err(|source| FormatError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_text(path: &Path, text: &str) -> Result<(), FormatError> {
    fs::write(path, text).map_err(|source| FormatError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_tokens<T: std::str::FromStr>(path: &Path, text: &str) -> Result<Vec<T>, FormatError> {
    let mut out = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        for token in line.split_whitespace() {
            let value = token.parse::<T>().map_err(|_| FormatError::Parse {
                path: path.to_path_buf(),
                line: line_no + 1,
                token: token.to_string(),
            })?;
            out.push(value);
        }
    }
    Ok(out)
}

fn check_group(path: &Path, found: usize, group: usize) -> Result<(), FormatError> {
    if found % group != 0 {
        return Err(FormatError::Truncated {
            path: path.to_path_buf(),
            group,
            found,
        });
    }
    Ok(())
}

/// Read integer `x y` pairs (template and chessboard point files).
pub fn read_point_pairs(path: impl AsRef<Path>) -> Result<Vec<Point2<i32>>, FormatError> {
    let path = path.as_ref();
    let values: Vec<i32> = parse_tokens(path, &read_text(path)?)?;
    check_group(path, values.len(), 2)?;
    Ok(values
        .chunks_exact(2)
        .map(|c| Point2::new(c[0], c[1]))
        .collect())
}

/// Read every whitespace separated float in a file.
pub fn read_floats(path: impl AsRef<Path>) -> Result<Vec<f32>, FormatError> {
    let path = path.as_ref();
    parse_tokens(path, &read_text(path)?)
}

/// Read a triangle mesh; the vertex count must be a multiple of three.
pub fn read_mesh(path: impl AsRef<Path>) -> Result<Vec<MeshVertex>, FormatError> {
    let path = path.as_ref();
    let values = read_floats(path)?;
    check_group(path, values.len(), 15)?;
    Ok(values
        .chunks_exact(5)
        .map(|v| MeshVertex::new([v[0], v[1], v[2]], [v[3], v[4]]))
        .collect())
}

pub fn write_mesh(path: impl AsRef<Path>, vertices: &[MeshVertex]) -> Result<(), FormatError> {
    let mut text = String::with_capacity(vertices.len() * 48);
    for v in vertices {
        let [x, y, z, s, t] = v.to_array();
        let _ = writeln!(text, "{x} {y} {z} {s} {t}");
    }
    write_text(path.as_ref(), &text)
}

/// Read `min_x min_y max_x max_y` rectangles.
pub fn read_rects(path: impl AsRef<Path>) -> Result<Vec<Rect2>, FormatError> {
    let path = path.as_ref();
    let values: Vec<f64> = parse_tokens(path, &read_text(path)?)?;
    check_group(path, values.len(), 4)?;
    Ok(values
        .chunks_exact(4)
        .map(|c| Rect2::from_corners(Point2::new(c[0], c[1]), Point2::new(c[2], c[3])))
        .collect())
}

pub fn write_rects(path: impl AsRef<Path>, rects: &[Rect2]) -> Result<(), FormatError> {
    let mut text = String::new();
    for r in rects {
        let [x0, y0, x1, y1] = r.to_array();
        let _ = writeln!(text, "{x0} {y0} {x1} {y1}");
    }
    write_text(path.as_ref(), &text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_pairs_parse_across_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("template_1.txt");
        fs::write(&path, "0 0\n100 0\n\n100 100\n0 100\n").expect("write");
        let pts = read_point_pairs(&path).expect("read");
        assert_eq!(pts.len(), 4);
        assert_eq!(pts[2], Point2::new(100, 100));
    }

    #[test]
    fn odd_point_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.txt");
        fs::write(&path, "1 2 3").expect("write");
        assert!(matches!(
            read_point_pairs(&path),
            Err(FormatError::Truncated { group: 2, .. })
        ));
        fs::write(&path, "1 x").expect("write");
        assert!(matches!(
            read_point_pairs(&path),
            Err(FormatError::Parse { line: 1, .. })
        ));
    }

    #[test]
    fn mesh_and_rects_survive_a_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mesh_path = dir.path().join("array1");
        let tri = vec![
            MeshVertex::new([0.0, 0.0, 0.0], [0.1, 0.2]),
            MeshVertex::new([1.5, 0.0, 0.0], [0.3, 0.2]),
            MeshVertex::new([0.0, -2.25, -0.5], [0.1, 0.9]),
        ];
        write_mesh(&mesh_path, &tri).expect("write mesh");
        assert_eq!(read_mesh(&mesh_path).expect("read mesh"), tri);

        let rect_path = dir.path().join("compensator");
        let rects = vec![Rect2::from_corners(
            Point2::new(-0.5, 0.25),
            Point2::new(0.125, -0.75),
        )];
        write_rects(&rect_path, &rects).expect("write rects");
        assert_eq!(read_rects(&rect_path).expect("read rects"), rects);
    }

    #[test]
    fn missing_file_is_reported_as_missing() {
        let err = read_mesh("/definitely/not/here/array9").unwrap_err();
        assert!(err.is_missing());
    }
}
