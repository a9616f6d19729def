//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **LocalFileExecutor**: ローカルディスク上のアップロード先へ転送する UploadExecutor
//! - **AdbExecutor**: `adb push` でデバイスへ転送する UploadExecutor
//!
//! 転送先の配置と受領証は `layout` で共通化。InMemoryTaskStore は `store` モジュールにあります。

pub mod adb_executor;
pub mod layout;
pub mod local_executor;

// 主要な型を再エクスポート
pub use self::adb_executor::{AdbClient, AdbConfig, AdbError, AdbExecutor};
pub use self::layout::attrs;
pub use self::local_executor::LocalFileExecutor;
