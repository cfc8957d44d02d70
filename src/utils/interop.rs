use std::io;

/// Converts a C return value that carries the error number itself
/// (as `ibv_*` calls do) to a Rust `Result`.
#[inline(always)]
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(ret))
    }
}

/// Same as [`from_c_ret`], but consult `f` for a more helpful message
/// before falling back to the OS error string.
#[inline(always)]
pub(crate) fn from_c_ret_explained(
    ret: i32,
    f: impl FnOnce(i32) -> Option<&'static str>,
) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        let kind = io::Error::from_raw_os_error(ret).kind();
        match f(ret) {
            Some(msg) => Err(io::Error::new(kind, msg)),
            None => Err(io::Error::from_raw_os_error(ret)),
        }
    }
}

/// Converts a C return value that signals failure with `-1` and leaves
/// the reason in `errno` (as `rdma_*` calls and `ibv_get_cq_event` do) to a
/// Rust `Result`.
#[inline(always)]
pub(crate) fn from_errno_ret(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explained_errors_keep_kind() {
        let err = from_c_ret_explained(libc::ENOMEM, |_| Some("send queue is full")).unwrap_err();
        assert_eq!(err.to_string(), "send queue is full");
        assert_eq!(err.kind(), io::Error::from_raw_os_error(libc::ENOMEM).kind());

        let err = from_c_ret_explained(libc::EIO, |_| None).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EIO));
        assert!(from_c_ret(0).is_ok());
    }
}
