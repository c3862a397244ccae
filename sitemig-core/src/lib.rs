mod admin;
mod classify;
mod drive;
mod fetch;

pub use admin::{ADMIN_API_BASE, AdminClient, AdminError, AdminOperation, AdminResponse, SiteRef};
pub use classify::{ApiErrorClass, classify_api_status};
pub use drive::{
    DOCUMENT_MIME, DOCX_MIME, DRIVE_API_BASE, DriveClient, DriveError, DriveFile, FOLDER_MIME, FileList,
    FileMetadata, FileQuery,
};
pub use fetch::{FetchError, FetchedPage, PageFetcher};
