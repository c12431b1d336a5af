use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use secrecy::{ExposeSecret, Secret};
use tokio::sync::OwnedMutexGuard;

use crate::error::AppError;

/// Parses a hex private key (with or without `0x`) into a local signer.
pub fn signer_from_hex(key: &Secret<String>) -> Result<PrivateKeySigner, AppError> {
    key.expose_secret()
        .trim()
        .parse::<PrivateKeySigner>()
        .map_err(|_| AppError::validation("private key is not a valid secp256k1 key"))
}

/// One submission lock per signing account.
///
/// The nonce is read and consumed between `acquire` and the guard drop, so two
/// submissions from one account can never observe the same nonce in-process.
/// An account's entry lives only while someone holds or waits on its lock.
#[derive(Default)]
pub struct AccountLocks {
    locks: Mutex<HashMap<Address, Arc<tokio::sync::Mutex<()>>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, account: Address) -> AccountGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(account).or_default().clone()
        };
        AccountGuard {
            locks: self,
            account,
            guard: Some(lock.lock_owned().await),
        }
    }

    pub fn tracked_accounts(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

pub struct AccountGuard<'a> {
    locks: &'a AccountLocks,
    account: Address,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for AccountGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.locks.lock().unwrap_or_else(PoisonError::into_inner);
        self.guard.take();
        // Waiters clone the entry under the map lock, so a count of one means nobody else wants it.
        if locks.get(&self.account).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.account);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn parses_keys_with_and_without_prefix() {
        let a = signer_from_hex(&Secret::new(KEY.to_string())).unwrap();
        let b = signer_from_hex(&Secret::new(KEY.trim_start_matches("0x").to_string())).unwrap();
        assert_eq!(a.address(), b.address());
        assert_eq!(
            a.address(),
            "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse::<Address>().unwrap()
        );
    }

    #[test]
    fn rejects_garbage_keys() {
        let err = signer_from_hex(&Secret::new("not-a-key".to_string())).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn same_account_is_serialized() {
        let locks = Arc::new(AccountLocks::new());
        let account = Address::repeat_byte(7);

        let guard = locks.acquire(account).await;
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(account).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("contender acquires after release")
            .unwrap();
    }

    #[tokio::test]
    async fn different_accounts_do_not_block() {
        let locks = AccountLocks::new();
        let _a = locks.acquire(Address::repeat_byte(1)).await;
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.acquire(Address::repeat_byte(2)))
            .await
            .expect("independent account lock");
        assert_eq!(locks.tracked_accounts(), 2);
    }

    #[tokio::test]
    async fn released_accounts_are_forgotten() {
        let locks = AccountLocks::new();
        for byte in 0..16u8 {
            let _guard = locks.acquire(Address::repeat_byte(byte)).await;
        }
        assert_eq!(locks.tracked_accounts(), 0);
    }

    #[tokio::test]
    async fn entry_survives_while_a_contender_waits() {
        let locks = Arc::new(AccountLocks::new());
        let account = Address::repeat_byte(9);

        let guard = locks.acquire(account).await;
        let (acquired_tx, acquired_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(account).await;
                acquired_tx.send(()).unwrap();
                release_rx.await.ok();
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(guard);
        acquired_rx.await.unwrap();
        assert_eq!(locks.tracked_accounts(), 1);

        release_tx.send(()).unwrap();
        contender.await.unwrap();
        assert_eq!(locks.tracked_accounts(), 0);
    }
}
