use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use similar::TextDiff;

use super::{
    Workspace, bool_arg, capped, optional_str, required_raw_str, required_str, usize_arg,
};
use crate::capability::{Capability, CapabilityError, Params};

pub const LIST_DIR_DEFAULT_MAX_ENTRIES: usize = 200;
pub const LIST_DIR_MAX_ENTRIES_LIMIT: usize = 1000;
pub const FILE_TAIL_DEFAULT_LINES: usize = 50;
pub const FILE_TAIL_MAX_LINES: usize = 2000;
pub const MAX_LINE_NUMBER: usize = 1_000_000;

fn read_bytes(workspace: &Workspace, requested: &str) -> Result<(PathBuf, Vec<u8>), CapabilityError> {
    let resolved = workspace.resolve(requested)?;
    if !resolved.is_file() {
        return Err(CapabilityError::new(
            "unsupported_path",
            format!("'{requested}' is not a regular file"),
        ));
    }
    let data = std::fs::read(&resolved).map_err(|err| {
        CapabilityError::new("io_error", format!("failed to read file '{requested}': {err}"))
    })?;
    Ok((resolved, data))
}

/// Lossy view for read-only capabilities.
fn read_text(workspace: &Workspace, requested: &str) -> Result<(PathBuf, String), CapabilityError> {
    let (resolved, data) = read_bytes(workspace, requested)?;
    Ok((resolved, String::from_utf8_lossy(&data).into_owned()))
}

/// Strict UTF-8 view for capabilities that write the content back.
fn read_utf8(workspace: &Workspace, requested: &str) -> Result<(PathBuf, String), CapabilityError> {
    let (resolved, data) = read_bytes(workspace, requested)?;
    let text = String::from_utf8(data).map_err(|err| {
        CapabilityError::new(
            "unsupported_encoding",
            format!(
                "'{requested}' is not valid UTF-8 (invalid byte at offset {}); refusing to rewrite it",
                err.utf8_error().valid_up_to()
            ),
        )
    })?;
    Ok((resolved, text))
}

pub struct ListDir {
    workspace: Arc<Workspace>,
}

impl ListDir {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Capability for ListDir {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List a directory (path, show_hidden, max_entries). Directories end with '/'."
    }

    fn side_effecting(&self) -> bool {
        false
    }

    async fn invoke(&self, params: &Params) -> Result<String, CapabilityError> {
        let requested = optional_str(params, "path").unwrap_or(".");
        let show_hidden = bool_arg(params, "show_hidden")?;
        let max_entries = usize_arg(
            params,
            "max_entries",
            LIST_DIR_DEFAULT_MAX_ENTRIES,
            1,
            LIST_DIR_MAX_ENTRIES_LIMIT,
        )?;

        let resolved = self.workspace.resolve(requested)?;
        if !resolved.is_dir() {
            return Err(CapabilityError::new(
                "unsupported_path",
                format!("'{requested}' is not a directory"),
            ));
        }

        let mut entries = std::fs::read_dir(&resolved)
            .map_err(|err| {
                CapabilityError::new(
                    "io_error",
                    format!("failed to read directory '{requested}': {err}"),
                )
            })?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                if !show_hidden && name.starts_with('.') {
                    return None;
                }
                let is_dir = entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false);
                Some(if is_dir { format!("{name}/") } else { name })
            })
            .collect::<Vec<String>>();
        entries.sort();

        let total = entries.len();
        if total > max_entries {
            entries.truncate(max_entries);
            entries.push(format!("... ({} more entries)", total - max_entries));
        }
        if entries.is_empty() {
            return Ok(format!(
                "{} is empty",
                self.workspace.display_path(&resolved)
            ));
        }
        Ok(entries.join("\n"))
    }
}

pub struct ReadSlice {
    workspace: Arc<Workspace>,
}

impl ReadSlice {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Capability for ReadSlice {
    fn name(&self) -> &str {
        "read_slice"
    }

    fn description(&self) -> &str {
        "Read lines start..=end (1-based, inclusive) of a file. end defaults to the last line."
    }

    fn side_effecting(&self) -> bool {
        false
    }

    async fn invoke(&self, params: &Params) -> Result<String, CapabilityError> {
        let requested = required_str(params, "path", "read_slice")?;
        let start = usize_arg(params, "start", 1, 1, MAX_LINE_NUMBER)?;
        let end = match params.get("end") {
            None | Some(serde_json::Value::Null) => None,
            Some(_) => Some(usize_arg(params, "end", start, 1, MAX_LINE_NUMBER)?),
        };
        if end.is_some_and(|end| end < start) {
            return Err(CapabilityError::invalid_args(format!(
                "invalid line range: end must be >= start ({start})"
            )));
        }

        let (_, content) = read_text(&self.workspace, requested)?;
        let selected = content
            .lines()
            .enumerate()
            .map(|(index, line)| (index + 1, line))
            .filter(|(number, _)| *number >= start && end.is_none_or(|end| *number <= end))
            .map(|(_, line)| line)
            .collect::<Vec<&str>>()
            .join("\n");
        Ok(capped(&selected, self.workspace.max_output_chars()))
    }
}

pub struct FileTail {
    workspace: Arc<Workspace>,
}

impl FileTail {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Capability for FileTail {
    fn name(&self) -> &str {
        "file_tail"
    }

    fn description(&self) -> &str {
        "Return the last N lines of a file (path, lines; default 50)."
    }

    fn side_effecting(&self) -> bool {
        false
    }

    async fn invoke(&self, params: &Params) -> Result<String, CapabilityError> {
        let requested = required_str(params, "path", "file_tail")?;
        let count = usize_arg(
            params,
            "lines",
            FILE_TAIL_DEFAULT_LINES,
            1,
            FILE_TAIL_MAX_LINES,
        )?;
        let (_, content) = read_text(&self.workspace, requested)?;
        let lines = content.lines().collect::<Vec<&str>>();
        let tail = lines[lines.len().saturating_sub(count)..].join("\n");
        Ok(capped(&tail, self.workspace.max_output_chars()))
    }
}

/// Find/replace patch of one file.
pub struct FileEdit {
    workspace: Arc<Workspace>,
}

struct PlannedEdit {
    resolved: PathBuf,
    display: String,
    original: String,
    updated: String,
    replaced: usize,
}

impl FileEdit {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }

    fn plan(&self, params: &Params) -> Result<PlannedEdit, CapabilityError> {
        let requested = required_str(params, "path", "file_edit")?;
        let find = required_raw_str(params, "find", "file_edit")?;
        let replace = params
            .get("replace")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| CapabilityError::invalid_args("'replace' is required for file_edit"))?;
        let replace_all = bool_arg(params, "replace_all")?;

        let (resolved, original) = read_utf8(&self.workspace, requested)?;
        let occurrences = original.matches(find).count();
        if occurrences == 0 {
            return Err(CapabilityError::new(
                "no_match",
                format!("'find' text was not found in '{requested}'"),
            ));
        }
        if occurrences > 1 && !replace_all {
            return Err(CapabilityError::new(
                "ambiguous_match",
                format!(
                    "'find' text appears {occurrences} times in '{requested}'; set replace_all=true or widen the match"
                ),
            ));
        }

        let updated = if replace_all {
            original.replace(find, replace)
        } else {
            original.replacen(find, replace, 1)
        };
        Ok(PlannedEdit {
            display: self.workspace.display_path(&resolved),
            resolved,
            original,
            updated,
            replaced: if replace_all { occurrences } else { 1 },
        })
    }
}

pub fn render_unified_diff(path: &str, old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(path, &format!("{path} (edited)"))
        .to_string()
}

#[async_trait]
impl Capability for FileEdit {
    fn name(&self) -> &str {
        "file_edit"
    }

    fn description(&self) -> &str {
        "Patch a file: replace 'find' with 'replace' (path, find, replace, replace_all). Asks before writing."
    }

    fn side_effecting(&self) -> bool {
        true
    }

    fn describe_action(&self, params: &Params) -> String {
        let path = optional_str(params, "path").unwrap_or("<missing>");
        format!("file_edit will modify '{path}' in place. Apply the diff above?")
    }

    fn preview(&self, params: &Params) -> Option<String> {
        match self.plan(params) {
            Ok(edit) => Some(render_unified_diff(&edit.display, &edit.original, &edit.updated)),
            Err(err) => Some(format!("file_edit cannot be applied: {}", err.message)),
        }
    }

    async fn invoke(&self, params: &Params) -> Result<String, CapabilityError> {
        let edit = self.plan(params)?;
        std::fs::write(&edit.resolved, edit.updated.as_bytes()).map_err(|err| {
            CapabilityError::new(
                "io_error",
                format!("failed to write patched content to '{}': {err}", edit.display),
            )
        })?;
        Ok(format!(
            "edited {} ({} replacement(s))",
            edit.display, edit.replaced
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::testing::object;

    fn workspace(dir: &Path) -> Arc<Workspace> {
        Arc::new(Workspace::new(dir, Duration::from_secs(5), 4000).unwrap())
    }

    fn numbered_file(dir: &Path, name: &str, count: usize) {
        let body = (1..=count)
            .map(|n| format!("line {n}"))
            .collect::<Vec<String>>()
            .join("\n");
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[tokio::test]
    async fn list_dir_sorts_and_hides_dotfiles_by_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::write(dir.path().join(".hidden"), "").unwrap();
        std::fs::create_dir(dir.path().join("a_dir")).unwrap();
        let list = ListDir::new(workspace(dir.path()));

        let listed = list.invoke(&Params::new()).await.unwrap();
        assert_eq!(listed, "a_dir/\nb.txt");

        let all = list
            .invoke(&object(json!({"show_hidden": true})))
            .await
            .unwrap();
        assert_eq!(all, ".hidden\na_dir/\nb.txt");
    }

    #[tokio::test]
    async fn read_slice_is_one_based_and_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        numbered_file(dir.path(), "notes.txt", 10);
        let read = ReadSlice::new(workspace(dir.path()));

        let slice = read
            .invoke(&object(json!({"path": "notes.txt", "start": 2, "end": 4})))
            .await
            .unwrap();
        assert_eq!(slice, "line 2\nline 3\nline 4");

        let rest = read
            .invoke(&object(json!({"path": "notes.txt", "start": 9})))
            .await
            .unwrap();
        assert_eq!(rest, "line 9\nline 10");

        let err = read
            .invoke(&object(json!({"path": "notes.txt", "start": 5, "end": 2})))
            .await
            .unwrap_err();
        assert_eq!(err.code, "invalid_args");
    }

    #[tokio::test]
    async fn file_tail_returns_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        numbered_file(dir.path(), "log.txt", 5);
        let tail = FileTail::new(workspace(dir.path()));
        let out = tail
            .invoke(&object(json!({"path": "log.txt", "lines": 2})))
            .await
            .unwrap();
        assert_eq!(out, "line 4\nline 5");
        assert!(
            tail.invoke(&object(json!({"path": "log.txt", "lines": 0})))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn file_edit_previews_then_applies_a_single_replacement() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.rs"), "fn old() {}\n").unwrap();
        let edit = FileEdit::new(workspace(dir.path()));
        let params = object(json!({"path": "lib.rs", "find": "old", "replace": "new"}));

        let preview = edit.preview(&params).unwrap();
        assert!(preview.contains("-fn old() {}"));
        assert!(preview.contains("+fn new() {}"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("lib.rs")).unwrap(),
            "fn old() {}\n"
        );

        let out = edit.invoke(&params).await.unwrap();
        assert_eq!(out, "edited ./lib.rs (1 replacement(s))");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("lib.rs")).unwrap(),
            "fn new() {}\n"
        );
    }

    #[tokio::test]
    async fn file_edit_rejects_missing_and_ambiguous_matches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x x x").unwrap();
        let edit = FileEdit::new(workspace(dir.path()));

        let missing = edit
            .invoke(&object(json!({"path": "a.txt", "find": "y", "replace": "z"})))
            .await
            .unwrap_err();
        assert_eq!(missing.code, "no_match");

        let ambiguous = edit
            .invoke(&object(json!({"path": "a.txt", "find": "x", "replace": "z"})))
            .await
            .unwrap_err();
        assert_eq!(ambiguous.code, "ambiguous_match");

        let all = edit
            .invoke(&object(
                json!({"path": "a.txt", "find": "x", "replace": "z", "replace_all": true}),
            ))
            .await
            .unwrap();
        assert!(all.contains("3 replacement(s)"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "z z z"
        );
    }

    #[tokio::test]
    async fn file_edit_refuses_files_that_are_not_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let original = b"# caf\xe9\nx = 1\n".to_vec();
        std::fs::write(dir.path().join("legacy.py"), &original).unwrap();
        let edit = FileEdit::new(workspace(dir.path()));
        let params = object(json!({"path": "legacy.py", "find": "x = 1", "replace": "x = 2"}));

        let err = edit.invoke(&params).await.unwrap_err();
        assert_eq!(err.code, "unsupported_encoding");
        assert!(err.message.contains("offset 5"));
        assert!(
            edit.preview(&params)
                .unwrap()
                .starts_with("file_edit cannot be applied")
        );
        assert_eq!(std::fs::read(dir.path().join("legacy.py")).unwrap(), original);

        let read = ReadSlice::new(workspace(dir.path()))
            .invoke(&object(json!({"path": "legacy.py", "start": 2})))
            .await
            .unwrap();
        assert_eq!(read, "x = 1");
    }
}
