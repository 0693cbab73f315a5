use snafu::prelude::*;
use std::path::PathBuf;

pub type Result<T, E = ScanTarError> = std::result::Result<T, E>;

/// Errors which are fatal to the pipeline.
///
/// Per-object failures (a single download that fails, a file the scanner rejects) are *not*
/// represented here; those travel the error bus as [`crate::ErrorEvent`]s and never stop the run.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ScanTarError {
    #[snafu(display("SRC_BUCKET and DST_BUCKET must both be set"))]
    MissingBucketConfig,

    #[snafu(display("invalid byte size '{input}'"))]
    InvalidByteSize { input: String },

    #[snafu(display("size cap of {given} bytes is below the {minimum} byte minimum"))]
    SizeCapTooSmall { given: u64, minimum: u64 },

    #[snafu(display("invalid duration '{input}'"))]
    InvalidDuration { input: String },

    #[snafu(display(
        "archive name template '{template}' must contain exactly one '%Nd' integer slot"
    ))]
    InvalidArchiveTemplate { template: String },

    #[snafu(display("invalid SUBSET selector '{input}'; expected START:STRIDE[:END]"))]
    InvalidSubset { input: String },

    #[snafu(display("signature definitions path '{}' is not usable", path.display()))]
    DefinitionsPath {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("signature definitions path '{}' is not a directory", path.display()))]
    DefinitionsNotADirectory { path: PathBuf },

    #[snafu(display("malformed signature at {}:{line}", path.display()))]
    MalformedSignature { path: PathBuf, line: usize },

    #[snafu(display("no signatures loaded from '{}'", path.display()))]
    EmptySignatureDb { path: PathBuf },

    #[snafu(display("the scan engine failed to initialize"))]
    ScanEngineInit,

    #[snafu(display("could not determine an AWS region"))]
    MissingRegion,

    #[snafu(display("error listing objects in bucket '{bucket}'"))]
    ListObjects {
        bucket: String,
        source: aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Error,
        >,
    },

    #[snafu(display("error fetching object '{key}' from bucket '{bucket}'"))]
    GetObject {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::get_object::GetObjectError>,
    },

    #[snafu(display("error reading body of object '{key}'"))]
    ReadObjectBody {
        key: String,
        source: aws_smithy_types::byte_stream::error::Error,
    },

    #[snafu(display("error starting multipart upload of '{key}' to bucket '{bucket}'"))]
    CreateMultipart {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::create_multipart_upload::CreateMultipartUploadError,
        >,
    },

    #[snafu(display("error uploading part {part_number} of '{key}'"))]
    UploadPart {
        key: String,
        part_number: i32,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::upload_part::UploadPartError>,
    },

    #[snafu(display("error completing multipart upload of '{key}'"))]
    CompleteMultipart {
        key: String,
        source: aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::complete_multipart_upload::CompleteMultipartUploadError,
        >,
    },

    #[snafu(display("multipart upload of '{key}' returned no upload id"))]
    MissingUploadId { key: String },

    #[snafu(display("upload part {part_number} of '{key}' returned no etag"))]
    MissingEtag { key: String, part_number: i32 },

    #[snafu(display("error opening upload part of '{}'", path.display()))]
    OpenUploadSection {
        path: PathBuf,
        source: aws_smithy_types::byte_stream::error::Error,
    },

    #[snafu(display("object '{key}' not found in bucket '{bucket}'"))]
    ObjectNotFound { bucket: String, key: String },

    #[snafu(display("object store failure: {message}"))]
    StoreFailure { message: String },

    #[snafu(display("no multipart upload '{upload_id}' is in progress for '{key}'"))]
    UnknownUpload { key: String, upload_id: String },

    #[snafu(display("error writing metadata index '{}'", path.display()))]
    WriteIndex {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("error reading metadata index '{}'", path.display()))]
    ReadIndex {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("metadata index '{}' has no summary line", path.display()))]
    MissingIndexSummary { path: PathBuf },

    #[snafu(display("error reading upload log '{}'", path.display()))]
    ReadUploadLog {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("error appending to upload log '{}'", path.display()))]
    AppendUploadLog {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("error creating error log '{}'", path.display()))]
    CreateErrorLog {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("error creating archive segment '{}'", path.display()))]
    CreateSegment {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("error writing '{key}' into archive segment"))]
    AppendSegment { key: String, source: std::io::Error },

    #[snafu(display("error finishing archive segment '{}'", path.display()))]
    FinishSegment {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("error reading archive segment '{}'", path.display()))]
    ReadSegment {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("a pipeline worker task panicked or was cancelled"))]
    StageJoin { source: tokio::task::JoinError },

    #[snafu(display("the run was aborted"))]
    Aborted,
}
