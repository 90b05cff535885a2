use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split `proto!addr!port` into its three `!`-separated parts.
pub fn parse_proto(arg: &str) -> Option<(&str, &str, &str)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);
    if split.next().is_some() {
        return None;
    }
    Some((proto, addr, port))
}

/// Split a walk path into its non-empty, `/`-separated components.
///
/// A leading `/` is stripped; an empty path yields zero components
/// (a zero-element walk, per the protocol).
pub fn split_path(path: &str) -> Vec<String> {
    path.trim_start_matches('/')
        .split('/')
        .filter(|c| !c.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proto_triple() {
        assert_eq!(
            parse_proto("tcp!127.0.0.1!564"),
            Some(("tcp", "127.0.0.1", "564"))
        );
        assert_eq!(parse_proto("tcp!onlytwo"), None);
        assert_eq!(parse_proto("tcp!a!b!c"), None);
    }

    #[test]
    fn splits_paths() {
        assert_eq!(split_path(""), Vec::<String>::new());
        assert_eq!(split_path("/"), Vec::<String>::new());
        assert_eq!(split_path("etc/passwd"), vec!["etc", "passwd"]);
        assert_eq!(split_path("/etc/passwd"), vec!["etc", "passwd"]);
        assert_eq!(split_path("/etc//passwd/"), vec!["etc", "passwd"]);
    }
}
