// Shader module loading and hot reload
//
// Shaders arrive as SPIR-V files compiled ahead of time (see build.rs).
// `ShaderWatcher` reports when any of them changes on disk.

use anyhow::{Context, Result};
use ash::vk;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};

use super::VulkanDevice;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Decode SPIR-V bytes into aligned words.
///
/// The length must be a whole number of 4-byte words and the module must
/// start with the SPIR-V magic number (either byte order).
pub fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes)).context("Malformed SPIR-V")?;
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        _ => anyhow::bail!("Not a SPIR-V module (bad magic number)"),
    }
}

/// Read a SPIR-V file and create a shader module from it
pub fn load_shader_module(device: &VulkanDevice, path: &Path) -> Result<vk::ShaderModule> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read shader {:?}", path))?;
    let code = parse_spirv(&bytes).with_context(|| format!("Failed to load shader {:?}", path))?;
    create_shader_module(device, &code)
}

pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe { device.device.create_shader_module(&create_info, None) }
        .context("Failed to create shader module")
}

/// Watches shader files and reports modifications
pub struct ShaderWatcher {
    // Kept alive for as long as we want events
    _watcher: RecommendedWatcher,
    events: Receiver<notify::Result<notify::Event>>,
    files: Vec<PathBuf>,
}

impl ShaderWatcher {
    pub fn new(files: &[&Path]) -> Result<Self> {
        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            // Receiver gone means we are shutting down
            let _ = tx.send(res);
        })
        .context("Failed to create file watcher")?;

        let files: Vec<PathBuf> = files
            .iter()
            .map(|f| std::fs::canonicalize(f).unwrap_or_else(|_| f.to_path_buf()))
            .collect();

        // Watch directories, editors often replace files instead of writing them
        let mut dirs: Vec<&Path> = files
            .iter()
            .map(|f| f.parent().unwrap_or(Path::new(".")))
            .collect();
        dirs.sort();
        dirs.dedup();
        for dir in dirs {
            let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("Failed to watch {:?}", dir))?;
            log::info!("Watching {:?} for shader changes", dir);
        }

        Ok(Self {
            _watcher: watcher,
            events: rx,
            files,
        })
    }

    /// Drain pending events; true if any watched shader changed since the last call
    pub fn changed(&self) -> bool {
        let mut changed = false;
        for event in self.events.try_iter() {
            match event {
                Ok(event) => changed |= touches(&event, &self.files),
                Err(e) => log::warn!("Shader watcher error: {}", e),
            }
        }
        changed
    }
}

/// Whether `event` creates or modifies one of `files`
fn touches(event: &notify::Event, files: &[PathBuf]) -> bool {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return false;
    }
    event
        .paths
        .iter()
        .any(|path| files.iter().any(|file| path == file || path.ends_with(file)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, ModifyKind, RemoveKind};
    use notify::Event;

    fn bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn parses_spirv_words() {
        let words = [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0];
        assert_eq!(parse_spirv(&bytes(&words)).unwrap(), words);
    }

    #[test]
    fn accepts_byte_swapped_modules() {
        let swapped: Vec<u8> = [SPIRV_MAGIC, 0x0001_0000]
            .iter()
            .flat_map(|w| w.to_be_bytes())
            .collect();
        assert_eq!(parse_spirv(&swapped).unwrap()[0], SPIRV_MAGIC);
    }

    #[test]
    fn rejects_partial_words() {
        let mut data = bytes(&[SPIRV_MAGIC, 0]);
        data.push(0);
        assert!(parse_spirv(&data).is_err());
    }

    #[test]
    fn rejects_wrong_magic() {
        assert!(parse_spirv(&bytes(&[0xdead_beef, 0])).is_err());
        assert!(parse_spirv(&[]).is_err());
    }

    #[test]
    fn modify_and_create_of_watched_files_count() {
        let files = vec![PathBuf::from("shaders/triangle.frag.spv")];

        let modify = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(PathBuf::from("/work/shaders/triangle.frag.spv"));
        assert!(touches(&modify, &files));

        let create = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("shaders/triangle.frag.spv"));
        assert!(touches(&create, &files));
    }

    #[test]
    fn other_files_and_kinds_are_ignored() {
        let files = vec![PathBuf::from("/work/shaders/triangle.frag.spv")];

        let other_file = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/work/shaders/triangle.frag"));
        assert!(!touches(&other_file, &files));

        let removed = Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(PathBuf::from("/work/shaders/triangle.frag.spv"));
        assert!(!touches(&removed, &files));

        let read = Event::new(EventKind::Access(AccessKind::Any))
            .add_path(PathBuf::from("/work/shaders/triangle.frag.spv"));
        assert!(!touches(&read, &files));
    }
}
