use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("unable to load configuration")]
    Config,
    #[display("unable to open the offline cache at `{_0}`")]
    Cache(#[error(not(source))] String),
    #[display("the offline cache is disabled")]
    CacheDisabled,
    #[display("unable to set up the {_0} backend")]
    Backend(#[error(not(source))] &'static str),
    /// Already phrased for the user.
    #[display("{_0}")]
    Failed(#[error(not(source))] String),
    #[display("request was superseded")]
    Superseded,
    #[display("unable to read `{_0}`")]
    ReadLocal(#[error(not(source))] String),
    #[display("unable to write `{_0}`")]
    WriteLocal(#[error(not(source))] String),
    #[display("unable to serve on {_0}")]
    Serve(#[error(not(source))] String),
}
