//! Process table queries, termination and spawning.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, PoisonError};

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus as OsStatus, ProcessesToUpdate, System, UpdateKind};

use crate::error::{Error, Result};
use crate::types::{ProcessRecord, ProcessSpec};

/// Image names that are never terminated, matched as case-insensitive
/// substrings of the process image name.
pub const PROTECTED_PROCESSES: &[&str] = &[
	"csrss.exe",
	"lsass.exe",
	"smss.exe",
	"services.exe",
	"svchost.exe",
	"wininit.exe",
	"winlogon.exe",
	"systemd",
	"launchd",
	"kthreadd",
];

pub fn is_protected(image_name: &str) -> bool {
	let name = image_name.to_ascii_lowercase();
	PROTECTED_PROCESSES.iter().any(|p| name.contains(p))
}

/// A logical drive and the device it maps to, e.g. `C:` and
/// `\Device\HarddiskVolume3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveMapping {
	pub letter: String,
	pub device: String,
}

impl DriveMapping {
	pub fn new(letter: impl Into<String>, device: impl Into<String>) -> Self {
		Self {
			letter: letter.into(),
			device: device.into(),
		}
	}
}

/// Rewrites a device-form path to drive-letter form using `drives`.
pub fn rewrite_device_path(device_path: &str, drives: &[DriveMapping]) -> Option<PathBuf> {
	drives.iter().find_map(|drive| {
		let device = drive.device.as_str();
		if device.is_empty() {
			return None;
		}
		let prefix = device_path.get(..device.len())?;
		if !prefix.eq_ignore_ascii_case(device) {
			return None;
		}
		let rest = &device_path[device.len()..];
		// \Device\HarddiskVolume1 must not claim \Device\HarddiskVolume10
		if !(rest.is_empty() || rest.starts_with('\\') || rest.starts_with('/')) {
			return None;
		}
		Some(PathBuf::from(format!("{}{}", drive.letter, rest)))
	})
}

fn is_device_form(path: &str) -> bool {
	path.get(..8)
		.map(|p| p.eq_ignore_ascii_case("\\Device\\"))
		.unwrap_or(false)
}

/// Splits a native command line into argv. Whitespace separates arguments,
/// double quotes group, `\"` is a literal quote; other backslashes are kept.
pub fn split_command_line(line: &str) -> Vec<String> {
	let mut args = Vec::new();
	let mut current = String::new();
	let mut in_quotes = false;
	let mut has_token = false;
	let mut chars = line.chars().peekable();

	while let Some(c) = chars.next() {
		match c {
			'\\' if chars.peek() == Some(&'"') => {
				chars.next();
				current.push('"');
				has_token = true;
			}
			'"' => {
				in_quotes = !in_quotes;
				has_token = true;
			}
			c if c.is_whitespace() && !in_quotes => {
				if has_token {
					args.push(std::mem::take(&mut current));
					has_token = false;
				}
			}
			c => {
				current.push(c);
				has_token = true;
			}
		}
	}
	if has_token {
		args.push(current);
	}
	args
}

/// Direct children of `parent_pid`, protected images excluded.
pub fn select_children(records: &[ProcessRecord], parent_pid: u32) -> Vec<u32> {
	records
		.iter()
		.filter(|r| r.parent_pid == Some(parent_pid) && r.pid != parent_pid)
		.filter(|r| {
			if is_protected(&r.name) {
				tracing::trace!("skipping protected child {} (pid {})", r.name, r.pid);
				return false;
			}
			true
		})
		.map(|r| r.pid)
		.collect()
}

/// Processes whose image is the same file as `executable`. Records whose
/// image cannot be resolved, or no longer exists on disk, never match.
pub fn select_by_executable(records: &[ProcessRecord], executable: &Path) -> Vec<u32> {
	let target = match executable.canonicalize() {
		Ok(p) => p,
		Err(e) => {
			tracing::debug!("cannot resolve {}: {}", executable.display(), e);
			return Vec::new();
		}
	};
	let own_pid = std::process::id();

	records
		.iter()
		.filter(|r| r.pid != own_pid)
		.filter(|r| {
			r.image_path
				.as_deref()
				.and_then(|p| p.canonicalize().ok())
				.map(|p| p == target)
				.unwrap_or(false)
		})
		.filter(|r| {
			if is_protected(&r.name) {
				tracing::trace!("skipping protected process {} (pid {})", r.name, r.pid);
				return false;
			}
			true
		})
		.map(|r| r.pid)
		.collect()
}

/// A freshly launched child and its pid.
#[derive(Debug)]
pub struct SpawnedProcess {
	pub pid: u32,
	pub child: Child,
}

pub struct ProcessDirectory {
	system: Mutex<System>,
}

impl Default for ProcessDirectory {
	fn default() -> Self {
		Self::new()
	}
}

impl ProcessDirectory {
	pub fn new() -> Self {
		Self {
			system: Mutex::new(System::new()),
		}
	}

	/// Enumerates every process on the host. Threads are not processes and
	/// are left out, even where the OS lists them alongside.
	pub fn snapshot(&self) -> Vec<ProcessRecord> {
		let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
		system.refresh_processes_specifics(
			ProcessesToUpdate::All,
			true,
			ProcessRefreshKind::nothing().with_exe(UpdateKind::Always),
		);
		let drives = sys::logical_drives();

		system
			.processes()
			.iter()
			.filter(|(_, process)| process.thread_kind().is_none())
			.map(|(pid, process)| {
				let pid = pid.as_u32();
				let raw = sys::device_image_path(pid)
					.map(PathBuf::from)
					.or_else(|| process.exe().map(Path::to_path_buf));
				ProcessRecord {
					pid,
					parent_pid: process.parent().map(|p| p.as_u32()),
					name: process.name().to_string_lossy().into_owned(),
					image_path: raw.and_then(|p| resolve_image_path(&p, &drives)),
				}
			})
			.collect()
	}

	pub fn find_children(&self, parent_pid: u32) -> Vec<u32> {
		let children = select_children(&self.snapshot(), parent_pid);
		tracing::trace!("pid {} has children {:?}", parent_pid, children);
		children
	}

	pub fn find_by_executable_path(&self, executable: &Path) -> Vec<u32> {
		select_by_executable(&self.snapshot(), executable)
	}

	/// Rewrites a device-form image path using the host's logical drives.
	pub fn resolve_device_path(&self, device_path: &str) -> Option<PathBuf> {
		rewrite_device_path(device_path, &sys::logical_drives())
	}

	pub fn is_protected(&self, image_name: &str) -> bool {
		is_protected(image_name)
	}

	/// Force-kills `pid`. A pid that no longer exists is not an error.
	pub fn terminate(&self, pid: u32, exit_code: u32) -> Result<()> {
		if pid == 0 {
			return Ok(());
		}
		sys::terminate(pid, exit_code)
	}

	/// Whether `pid` exists and has not exited (zombies count as exited).
	pub fn is_alive(&self, pid: u32) -> bool {
		let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
		let pid = Pid::from_u32(pid);
		system.refresh_processes_specifics(
			ProcessesToUpdate::Some(&[pid]),
			true,
			ProcessRefreshKind::nothing(),
		);
		system
			.process(pid)
			.map(|p| !matches!(p.status(), OsStatus::Zombie | OsStatus::Dead))
			.unwrap_or(false)
	}

	/// Launches `spec` detached from any console, with null stdio.
	pub fn spawn(&self, spec: &ProcessSpec) -> Result<SpawnedProcess> {
		let argv = split_command_line(&spec.command);
		let mut cmd = Command::new(&spec.executable);
		if let Some((_, args)) = argv.split_first() {
			cmd.args(args);
		}
		if !spec.directory.as_os_str().is_empty() {
			cmd.current_dir(&spec.directory);
		}
		cmd.envs(&spec.env)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null());
		sys::prepare(&mut cmd, spec, argv.first().map(String::as_str))?;

		let child = cmd.spawn().map_err(|source| Error::Spawn {
			executable: spec.executable.clone(),
			source,
		})?;
		Ok(SpawnedProcess {
			pid: child.id(),
			child,
		})
	}
}

fn resolve_image_path(raw: &Path, drives: &[DriveMapping]) -> Option<PathBuf> {
	let text = raw.to_string_lossy();
	if is_device_form(&text) {
		rewrite_device_path(&text, drives)
	} else {
		Some(raw.to_path_buf())
	}
}

#[cfg(unix)]
mod sys {
	use std::os::unix::process::CommandExt;
	use std::process::Command;

	use nix::errno::Errno;
	use nix::sys::signal::{kill, Signal};
	use nix::unistd::{Pid, User};

	use super::DriveMapping;
	use crate::error::{Error, Result};
	use crate::types::ProcessSpec;

	pub fn logical_drives() -> Vec<DriveMapping> {
		Vec::new()
	}

	pub fn device_image_path(_pid: u32) -> Option<String> {
		None
	}

	pub fn terminate(pid: u32, _exit_code: u32) -> Result<()> {
		let raw = i32::try_from(pid).map_err(|_| Error::Terminate {
			pid,
			reason: "pid out of range".to_string(),
		})?;
		match kill(Pid::from_raw(raw), Signal::SIGKILL) {
			Ok(()) | Err(Errno::ESRCH) => Ok(()),
			Err(e) => Err(Error::Terminate {
				pid,
				reason: e.to_string(),
			}),
		}
	}

	pub fn prepare(cmd: &mut Command, spec: &ProcessSpec, argv0: Option<&str>) -> Result<()> {
		// own process group, so a Ctrl-C aimed at the supervisor skips children
		cmd.process_group(0);
		if let Some(argv0) = argv0 {
			cmd.arg0(argv0);
		}
		if spec.runs_as_other_user() {
			let user = User::from_name(&spec.user)
				.ok()
				.flatten()
				.ok_or_else(|| Error::UnknownUser(spec.user.clone()))?;
			cmd.uid(user.uid.as_raw()).gid(user.gid.as_raw());
		}
		Ok(())
	}
}

#[cfg(windows)]
mod sys {
	use std::os::windows::process::CommandExt;
	use std::process::Command;

	use windows::core::PCWSTR;
	use windows::Win32::Foundation::CloseHandle;
	use windows::Win32::Storage::FileSystem::{GetLogicalDriveStringsW, QueryDosDeviceW};
	use windows::Win32::System::ProcessStatus::GetProcessImageFileNameW;
	use windows::Win32::System::Threading::{
		OpenProcess, TerminateProcess, CREATE_NO_WINDOW, PROCESS_QUERY_LIMITED_INFORMATION,
		PROCESS_TERMINATE,
	};

	use super::DriveMapping;
	use crate::error::{Error, Result};
	use crate::types::ProcessSpec;

	pub fn logical_drives() -> Vec<DriveMapping> {
		let mut roots = [0u16; 512];
		let len = unsafe { GetLogicalDriveStringsW(Some(&mut roots)) } as usize;
		if len == 0 || len > roots.len() {
			return Vec::new();
		}

		roots[..len]
			.split(|c| *c == 0)
			.filter(|root| root.len() >= 2)
			.filter_map(|root| {
				// "C:\" -> "C:"
				let letter: Vec<u16> = root[..2].iter().copied().chain(std::iter::once(0)).collect();
				let mut target = [0u16; 1024];
				let n = unsafe { QueryDosDeviceW(PCWSTR(letter.as_ptr()), Some(&mut target)) } as usize;
				if n == 0 {
					return None;
				}
				let end = target[..n].iter().position(|c| *c == 0).unwrap_or(n);
				Some(DriveMapping {
					letter: String::from_utf16_lossy(&letter[..2]),
					device: String::from_utf16_lossy(&target[..end]),
				})
			})
			.collect()
	}

	pub fn device_image_path(pid: u32) -> Option<String> {
		unsafe {
			let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid).ok()?;
			let mut name = [0u16; 2048];
			let n = GetProcessImageFileNameW(handle, &mut name) as usize;
			let _ = CloseHandle(handle);
			if n == 0 {
				return None;
			}
			Some(String::from_utf16_lossy(&name[..n]))
		}
	}

	pub fn terminate(pid: u32, exit_code: u32) -> Result<()> {
		unsafe {
			let handle = match OpenProcess(PROCESS_TERMINATE, false, pid) {
				Ok(h) => h,
				Err(_) => return Ok(()),
			};
			let result = TerminateProcess(handle, exit_code);
			let _ = CloseHandle(handle);
			result.map_err(|e| Error::Terminate {
				pid,
				reason: e.to_string(),
			})
		}
	}

	pub fn prepare(cmd: &mut Command, spec: &ProcessSpec, _argv0: Option<&str>) -> Result<()> {
		cmd.creation_flags(CREATE_NO_WINDOW.0);
		if spec.runs_as_other_user() {
			tracing::warn!(
				"{}: running as `{}` is not supported on this platform, using the service account",
				spec.name,
				spec.user
			);
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn drives() -> Vec<DriveMapping> {
		vec![
			DriveMapping::new("C:", "\\Device\\HarddiskVolume1"),
			DriveMapping::new("D:", "\\Device\\HarddiskVolume10"),
		]
	}

	fn record(pid: u32, parent: Option<u32>, name: &str, image: Option<&Path>) -> ProcessRecord {
		ProcessRecord {
			pid,
			parent_pid: parent,
			name: name.to_string(),
			image_path: image.map(Path::to_path_buf),
		}
	}

	#[test]
	fn test_rewrite_device_path() {
		assert_eq!(
			rewrite_device_path("\\Device\\HarddiskVolume1\\apps\\worker.exe", &drives()),
			Some(PathBuf::from("C:\\apps\\worker.exe"))
		);
		assert_eq!(
			rewrite_device_path("\\device\\harddiskvolume1\\apps\\worker.exe", &drives()),
			Some(PathBuf::from("C:\\apps\\worker.exe"))
		);
		assert_eq!(
			rewrite_device_path("\\Device\\HarddiskVolume10\\bin\\x.exe", &drives()),
			Some(PathBuf::from("D:\\bin\\x.exe"))
		);
		assert_eq!(rewrite_device_path("\\Device\\Mup\\share\\x.exe", &drives()), None);
		assert_eq!(rewrite_device_path("", &drives()), None);
		assert_eq!(rewrite_device_path("\\Device\\HarddiskVolume1\\a", &[]), None);
	}

	#[test]
	fn test_resolve_image_path_passes_logical_paths_through() {
		let plain = Path::new("/usr/bin/worker");
		assert_eq!(resolve_image_path(plain, &drives()), Some(plain.to_path_buf()));
		assert_eq!(
			resolve_image_path(Path::new("\\Device\\HarddiskVolume1\\w.exe"), &drives()),
			Some(PathBuf::from("C:\\w.exe"))
		);
		assert_eq!(resolve_image_path(Path::new("\\Device\\Floppy0\\w.exe"), &drives()), None);
	}

	#[test]
	fn test_is_protected() {
		assert!(is_protected("svchost.exe"));
		assert!(is_protected("SVCHOST.EXE"));
		assert!(is_protected("csrss.exe"));
		assert!(is_protected("systemd-journald"));
		assert!(!is_protected("worker.exe"));
		assert!(!is_protected("sleep"));
	}

	#[test]
	fn test_split_command_line() {
		assert_eq!(split_command_line("worker.exe --id 1"), vec!["worker.exe", "--id", "1"]);
		assert_eq!(
			split_command_line("  \"C:\\Program Files\\w.exe\"   -m \"a b\" "),
			vec!["C:\\Program Files\\w.exe", "-m", "a b"]
		);
		assert_eq!(split_command_line("echo \\\"hi\\\""), vec!["echo", "\"hi\""]);
		assert_eq!(split_command_line("x \"\""), vec!["x", ""]);
		assert!(split_command_line("   ").is_empty());
	}

	#[test]
	fn test_select_children_skips_protected() {
		let records = vec![
			record(10, Some(1), "parent", None),
			record(11, Some(10), "child-a", None),
			record(12, Some(10), "svchost.exe", None),
			record(13, Some(11), "grandchild", None),
			record(14, None, "orphan", None),
		];
		assert_eq!(select_children(&records, 10), vec![11]);
		assert!(select_children(&records, 99).is_empty());
	}

	#[test]
	fn test_select_by_executable() {
		let dir = std::env::temp_dir().join(format!("rengoku-select-{}", std::process::id()));
		std::fs::create_dir_all(&dir).unwrap();
		let worker = dir.join("worker.exe");
		let other = dir.join("other.exe");
		std::fs::write(&worker, b"").unwrap();
		std::fs::write(&other, b"").unwrap();
		let removed = dir.join("removed.exe");

		let records = vec![
			record(100, Some(1), "worker.exe", Some(&worker)),
			record(101, Some(1), "other.exe", Some(&other)),
			record(102, Some(1), "svchost.exe", Some(&worker)),
			record(103, Some(1), "worker.exe", None),
			record(104, Some(1), "removed.exe", Some(&removed)),
			record(105, Some(1), "worker.exe", Some(&dir.join(".").join("worker.exe"))),
		];

		assert_eq!(select_by_executable(&records, &worker), vec![100, 105]);
		assert!(select_by_executable(&records, &removed).is_empty());

		let _ = std::fs::remove_dir_all(&dir);
	}

	#[test]
	fn test_snapshot_leaves_out_threads() {
		let (senders, workers): (Vec<_>, Vec<_>) = (0..3)
			.map(|_| {
				let (tx, rx) = std::sync::mpsc::channel::<()>();
				(tx, std::thread::spawn(move || {
					let _ = rx.recv();
				}))
			})
			.unzip();

		let directory = ProcessDirectory::new();
		let own = std::process::id();
		let exe = std::env::current_exe().unwrap();

		assert!(directory.find_by_executable_path(&exe).is_empty());
		let records = directory.snapshot();
		assert_eq!(records.iter().filter(|r| r.pid == own).count(), 1);

		#[cfg(target_os = "linux")]
		{
			let tids: Vec<u32> = std::fs::read_dir("/proc/self/task")
				.unwrap()
				.filter_map(|e| e.ok()?.file_name().to_str()?.parse().ok())
				.collect();
			assert!(tids.len() >= 4);
			let children = directory.find_children(own);
			assert!(children.iter().all(|c| !tids.contains(c)), "threads listed as children: {:?}", children);
			assert!(records.iter().all(|r| r.pid == own || !tids.contains(&r.pid)));
		}

		drop(senders);
		for worker in workers {
			worker.join().unwrap();
		}
	}
}
