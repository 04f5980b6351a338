//! Dependency manifest extraction for interpreted programs.
//!
//! The entry file may open with a comment block naming its requirements:
//!
//! ```text
//! # requests
//! # numpy
//! # requests==2.31
//! # end
//! ```

use std::path::Path;
use tokio::fs;

pub const MANIFEST_FILE: &str = "requirements.txt";

const BLOCK_START: &str = "# requests";
const BLOCK_END: &str = "# end";

/// Returns the requirements named by the marker block, in order.
///
/// Without a block on the first line the list is empty. An unterminated block ends at
/// the first line that is not a comment.
pub fn extract_requirements(source: &str) -> Vec<String> {
    let mut lines = source.lines().map(str::trim);
    if lines.next() != Some(BLOCK_START) {
        return Vec::new();
    }
    let mut requirements = Vec::new();
    for line in lines {
        if line == BLOCK_END {
            break;
        }
        let Some(entry) = line.strip_prefix('#') else {
            break;
        };
        let entry = entry.trim();
        if !entry.is_empty() {
            requirements.push(entry.to_string());
        }
    }
    requirements
}

/// Writes `requirements.txt` next to the entry file. The file is always created so
/// the install step in the entry command never fails on a missing manifest.
pub async fn write_manifest(dir: &Path, entry_file: &str) -> std::io::Result<Vec<String>> {
    let source = fs::read_to_string(dir.join(entry_file)).await?;
    let requirements = extract_requirements(&source);
    let mut content = requirements.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    fs::write(dir.join(MANIFEST_FILE), content).await?;
    Ok(requirements)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_block() {
        let source = "# requests\n# numpy\n#  pymysql==1.1 \n# end\nimport numpy\n";
        assert_eq!(extract_requirements(source), vec!["numpy", "pymysql==1.1"]);
    }

    #[test]
    fn test_no_block_means_no_requirements() {
        assert!(extract_requirements("import sys\n# requests\n# numpy\n# end\n").is_empty());
        assert!(extract_requirements("").is_empty());
    }

    #[test]
    fn test_unterminated_block_stops_at_code() {
        let source = "# requests\n# numpy\nimport numpy\n# not-a-requirement\n";
        assert_eq!(extract_requirements(source), vec!["numpy"]);
    }

    #[tokio::test]
    async fn test_write_manifest_always_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "print(1)\n").unwrap();
        let requirements = write_manifest(dir.path(), "main.py").await.unwrap();
        assert!(requirements.is_empty());
        assert_eq!(
            std::fs::read_to_string(dir.path().join(MANIFEST_FILE)).unwrap(),
            ""
        );

        std::fs::write(dir.path().join("main.py"), "# requests\n# redis\n# end\n").unwrap();
        write_manifest(dir.path(), "main.py").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join(MANIFEST_FILE)).unwrap(),
            "redis\n"
        );
    }
}
