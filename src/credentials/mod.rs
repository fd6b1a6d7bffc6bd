//! # Credential Resolution
//!
//! Produces short-lived bearer tokens for the cloud backends from one of
//! three sources: a static token, an external executable, or an instance
//! metadata service.

pub mod executable;
pub mod metadata;
pub mod parse;
pub mod provider;
pub mod resolver;
pub mod runner;
pub mod source;

pub use metadata::MetadataClient;
pub use provider::TokenProvider;
pub use resolver::CredentialResolver;
pub use runner::{CommandOutput, CommandRunner, TokioCommandRunner};
pub use source::{
    CredentialSource, ExecutableSource, MetadataProvider, MetadataSource, OutputFormat,
    StaticSource,
};
