use nix::{
    errno::Errno,
    unistd::{access, AccessFlags},
};
use std::{env, ffi::CString, ffi::NulError, path::Path, result};

use crate::diag::{Error, Result};

fn is_executable(path: &Path) -> bool {
    access(path, AccessFlags::X_OK).is_ok() && path.is_file()
}

fn find_executable_in_path(file_name: &str) -> Option<String> {
    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths).find_map(|dir| {
            let full_path = dir.join(file_name);
            if is_executable(&full_path) {
                full_path.to_str().map(String::from)
            } else {
                None
            }
        })
    })
}

/// Turns a command line into `execve` arguments, resolving the program
/// through `PATH` when it is not a path to an executable.
///
/// # Errors
///
/// Will return `Err` if `command` is empty, if the program is not found or
/// not executable, or if an argument contains a NUL byte.
pub fn command(command: &[String]) -> Result<Vec<CString>> {
    let (program, rest) = command
        .split_first()
        .ok_or_else(|| Error::from(Errno::EINVAL))?;

    let executable_path = if program.contains('/') {
        if !is_executable(Path::new(program)) {
            return Err(Error::from(Errno::EACCES));
        }
        program.clone()
    } else {
        find_executable_in_path(program).ok_or(Error::from(Errno::ENOENT))?
    };

    let mut args = vec![CString::new(executable_path)?];
    args.extend(
        rest.iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<result::Result<Vec<_>, NulError>>()?,
    );
    Ok(args)
}

/// # Errors
///
/// Will return `Err` if failing to convert environment variables to `CString`.
pub fn env() -> Result<Vec<CString>> {
    env::vars_os()
        .map(|(key, val)| {
            let e = "Error: OsString conversion failed";
            let key_str = key.into_string().map_err(|_| Error::from(e.to_string()))?;
            let val_str = val.into_string().map_err(|_| Error::from(e.to_string()))?;
            CString::new(format!("{key_str}={val_str}")).map_err(Error::from)
        })
        .collect()
}
