// Keeps the delay effect's slider range in step with the configured maximum
//
// The effect declares its delay parameter as
// `slider1:<default><<min>,<max>[,<step>]><label>`; the DAW recompiles the
// effect when the file changes.

use std::path::Path;

use super::{AudioError, Result};

const SLIDER_PREFIX: &str = "slider1:";

/// Rewrite the upper bound of `slider1` to `max_ms`.
///
/// Returns `Ok(true)` if the file was changed.
pub fn sync_delay_range(path: &Path, max_ms: u32) -> Result<bool> {
    let source = std::fs::read_to_string(path)?;
    let mut changed = false;
    let mut found = false;

    let lines: Vec<String> = source
        .lines()
        .map(|line| -> Result<String> {
            if found || !line.trim_start().starts_with(SLIDER_PREFIX) {
                return Ok(line.to_string());
            }
            found = true;
            let rewritten = with_max(line, max_ms)?;
            changed = rewritten != line;
            Ok(rewritten)
        })
        .collect::<Result<_>>()?;

    if !found {
        return Err(AudioError::Effect(format!(
            "{} has no {} declaration",
            path.display(),
            SLIDER_PREFIX
        )));
    }

    if changed {
        let mut output = lines.join("\n");
        if source.ends_with('\n') {
            output.push('\n');
        }
        std::fs::write(path, output)?;
        log::info!("[Audio] delay range of {} set to {} ms", path.display(), max_ms);
    }
    Ok(changed)
}

fn with_max(line: &str, max_ms: u32) -> Result<String> {
    let malformed = || AudioError::Effect(format!("malformed slider declaration: {}", line));

    let max = max_ms.to_string();
    let (head, rest) = line.split_once('<').ok_or_else(malformed)?;
    let (range, label) = rest.split_once('>').ok_or_else(malformed)?;
    let mut bounds: Vec<&str> = range.split(',').collect();
    if bounds.len() < 2 {
        return Err(malformed());
    }
    bounds[1] = &max;

    Ok(format!("{}<{}>{}", head, bounds.join(","), label))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EFFECT: &str = "desc:MIDI delay\n\nslider1:0<0,10000,1>Delay (ms)\nslider2:1<0,1,1>Mix\n";

    #[test]
    fn rewrites_only_the_first_slider() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("midi_delay.jsfx");
        std::fs::write(&path, EFFECT).unwrap();

        assert!(sync_delay_range(&path, 5000).unwrap());
        let updated = std::fs::read_to_string(&path).unwrap();
        assert!(updated.contains("slider1:0<0,5000,1>Delay (ms)\n"));
        assert!(updated.contains("slider2:1<0,1,1>Mix\n"));

        // already in sync
        assert!(!sync_delay_range(&path, 5000).unwrap());
    }

    #[test]
    fn missing_declaration_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.jsfx");
        std::fs::write(&path, "desc:nothing here\n").unwrap();
        assert!(matches!(sync_delay_range(&path, 100), Err(AudioError::Effect(_))));
    }

    #[test]
    fn range_without_step_is_supported() {
        assert_eq!(
            with_max("slider1:250<0,1000>Delay", 2000).unwrap(),
            "slider1:250<0,2000>Delay"
        );
        assert!(with_max("slider1:250 Delay", 2000).is_err());
    }
}
