mod client;

pub use client::{
    ApiError, ApiErrorClass, CloudClient, FolderListing, FolderPage, RemoteItem, RemoteItemType,
};
