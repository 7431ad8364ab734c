//! Windows paths as seen from inside Cygwin or WSL.

fn translate(win_path: &str, mount: &str) -> String {
    let path = win_path.replace('\\', "/");
    let mut chars = path.chars();
    match (chars.next(), chars.next()) {
        (Some(drive), Some(':')) if drive.is_ascii_alphabetic() => {
            format!("{:}/{:}{:}", mount, drive.to_ascii_lowercase(), &path[2..])
        }
        _ => path,
    }
}

/// `C:\a\b` -> `/cygdrive/c/a/b`
pub fn to_cygwin_path(win_path: &str) -> String {
    translate(win_path, "/cygdrive")
}

/// `C:\a\b` -> `/mnt/c/a/b`
pub fn to_wsl_path(win_path: &str) -> String {
    translate(win_path, "/mnt")
}
