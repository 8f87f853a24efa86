//! 本地路径展开
//!
//! 负责:
//! - 递归扫描本地文件夹（walkdir）
//! - 将命令行给出的文件和文件夹混合列表展开为文件列表
//!
//! 这里不做大小/类型过滤，所有文件都交给校验器，让被拒绝的文件可见

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// 文件扫描结果
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 相对于扫描根目录的路径
    pub relative_path: PathBuf,
    /// 文件大小（字节）
    pub size: u64,
}

/// 文件夹扫描配置
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// 是否跟随符号链接
    pub follow_symlinks: bool,
    /// 最大递归深度（None 表示不限制）
    pub max_depth: Option<usize>,
    /// 最大文件数量，达到后停止扫描
    pub max_files: Option<usize>,
    /// 跳过隐藏文件（以.开头的文件和文件夹）
    pub skip_hidden: bool,
}

/// 文件夹扫描器
#[derive(Debug, Clone, Default)]
pub struct FolderScanner {
    options: ScanOptions,
}

impl FolderScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ScanOptions) -> Self {
        Self { options }
    }

    /// 递归扫描文件夹，按相对路径排序
    pub fn scan<P: AsRef<Path>>(&self, root_path: P) -> Result<Vec<ScannedFile>> {
        let root_path = root_path.as_ref();

        if !root_path.exists() {
            anyhow::bail!("扫描路径不存在: {}", root_path.display());
        }
        if !root_path.is_dir() {
            anyhow::bail!("扫描路径不是文件夹: {}", root_path.display());
        }

        info!("开始扫描文件夹: {}", root_path.display());

        let mut walker = WalkDir::new(root_path).follow_links(self.options.follow_symlinks);
        if let Some(depth) = self.options.max_depth {
            walker = walker.max_depth(depth);
        }

        let skip_hidden = self.options.skip_hidden;
        let mut files = Vec::new();

        for entry in walker
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !(skip_hidden && is_hidden(e)))
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    // 单个条目无法访问时跳过，继续扫描其余部分
                    warn!("扫描条目失败: {}", e);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            if let Some(max) = self.options.max_files {
                if files.len() >= max {
                    warn!("达到最大文件数量限制 {}，停止扫描", max);
                    break;
                }
            }

            let size = match entry.metadata() {
                Ok(metadata) => metadata.len(),
                Err(e) => {
                    warn!("读取文件元数据失败: {}, 错误: {}", entry.path().display(), e);
                    continue;
                }
            };

            let relative_path = entry
                .path()
                .strip_prefix(root_path)
                .with_context(|| format!("计算相对路径失败: {}", entry.path().display()))?
                .to_path_buf();

            debug!("发现文件: {} ({} bytes)", relative_path.display(), size);

            files.push(ScannedFile {
                local_path: entry.path().to_path_buf(),
                relative_path,
                size,
            });
        }

        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        info!(
            "扫描完成: {} 个文件, 总大小 {} bytes",
            files.len(),
            files.iter().map(|f| f.size).sum::<u64>()
        );

        Ok(files)
    }

    /// 展开文件与文件夹混合列表
    ///
    /// 文件按给出的顺序保留，文件夹原地替换为其中的文件
    pub fn expand_paths<P: AsRef<Path>>(&self, paths: &[P]) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for path in paths {
            let path = path.as_ref();
            let metadata = std::fs::metadata(path)
                .with_context(|| format!("无法访问路径: {}", path.display()))?;

            if metadata.is_dir() {
                out.extend(self.scan(path)?.into_iter().map(|f| f.local_path));
            } else {
                out.push(path.to_path_buf());
            }
        }
        Ok(out)
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}
