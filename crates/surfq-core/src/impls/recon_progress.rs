//! Progress extraction from the external unit's stdout.
//!
//! Two line formats are understood:
//! - FreeSurfer `recon-all` stage markers: `#@# <Stage> [lh|rh] <date>`
//! - Generic tool lines: `PROGRESS <percent> <step description>`

/// One progress observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressLine {
    pub progress: i64,
    pub step: String,
}

/// recon-all -all stages in execution order with the percentage reached when
/// the stage starts.
const RECON_STAGES: &[(&str, i64)] = &[
    ("MotionCor", 2),
    ("Motion Correction", 2),
    ("Talairach", 4),
    ("Talairach Failure Detection", 5),
    ("Nu Intensity Correction", 7),
    ("Intensity Normalization", 9),
    ("Skull Stripping", 11),
    ("EM Registration", 14),
    ("CA Normalize", 17),
    ("CA Reg", 22),
    ("SubCort Seg", 30),
    ("CC Seg", 33),
    ("Merge ASeg", 34),
    ("Intensity Normalization2", 36),
    ("Mask BFS", 37),
    ("WM Segmentation", 39),
    ("Fill", 41),
    ("Tessellate", 43),
    ("Smooth1", 45),
    ("Inflation1", 47),
    ("QSphere", 50),
    ("Fix Topology", 55),
    ("Make White Surf", 60),
    ("Smooth2", 62),
    ("Inflation2", 64),
    ("Curv .H and .K", 66),
    ("Sphere", 70),
    ("Surf Reg", 75),
    ("Jacobian white", 77),
    ("AvgCurv", 78),
    ("Cortical Parc", 80),
    ("Make Pial Surf", 84),
    ("Cortical ribbon mask", 87),
    ("Cortical Parc 2", 89),
    ("Cortical Parc 3", 90),
    ("Pctsurfcon", 91),
    ("Relabel Hypointensities", 92),
    ("APas-to-ASeg", 93),
    ("AParc-to-ASeg", 94),
    ("WMParc", 95),
    ("Parcellation Stats", 96),
    ("BA_exvivo Labels", 98),
];

pub fn parse_line(line: &str) -> Option<ProgressLine> {
    let line = line.trim();
    if let Some(marker) = line.strip_prefix("#@#") {
        return Some(parse_recon_marker(marker.trim()));
    }
    if let Some(rest) = line.strip_prefix("PROGRESS ") {
        let mut parts = rest.trim().splitn(2, char::is_whitespace);
        let progress = parts.next()?.trim_end_matches('%').parse::<i64>().ok()?;
        let step = parts.next().unwrap_or("").trim();
        return Some(ProgressLine {
            progress,
            step: if step.is_empty() {
                format!("{progress}%")
            } else {
                step.to_string()
            },
        });
    }
    None
}

/// Longest known stage name that prefixes the marker wins, so
/// `Cortical Parc 2` is not read as `Cortical Parc`.
fn parse_recon_marker(marker: &str) -> ProgressLine {
    let best = RECON_STAGES
        .iter()
        .filter(|(name, _)| {
            marker.starts_with(name)
                && marker[name.len()..]
                    .chars()
                    .next()
                    .is_none_or(char::is_whitespace)
        })
        .max_by_key(|(name, _)| name.len());

    match best {
        Some((name, progress)) => {
            let rest = marker[name.len()..].trim_start();
            let step = match rest.split_whitespace().next() {
                Some(hemi @ ("lh" | "rh")) => format!("{name} {hemi}"),
                _ => (*name).to_string(),
            };
            ProgressLine {
                progress: *progress,
                step,
            }
        }
        // Unknown stage: report the step, keep whatever progress was reached.
        None => ProgressLine {
            progress: 0,
            step: marker.to_string(),
        },
    }
}
