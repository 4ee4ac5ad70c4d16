mod common;

use chrono::{TimeZone, Utc};
use common::{FIXTURE_PASSWORD, FIXTURE_THUMBPRINT, fixture};
use m365_admin::auth::CertificateManager;
use m365_admin::error::CertificateError;

#[tokio::test]
async fn test_pfx_and_pem_agree_on_thumbprint() {
    let manager = CertificateManager::new();

    let pfx = manager
        .load_from_file(fixture("service-principal.pfx"), Some(FIXTURE_PASSWORD))
        .await
        .unwrap();
    let aes = manager
        .load_from_file(fixture("service-principal-aes.pfx"), Some(FIXTURE_PASSWORD))
        .await
        .unwrap();
    let pkcs8 = manager.load_from_file(fixture("service-principal.pem"), None).await.unwrap();
    let pkcs1 = manager
        .load_from_file(fixture("service-principal-pkcs1.pem"), None)
        .await
        .unwrap();

    for bundle in [&pfx, &aes, &pkcs8, &pkcs1] {
        assert_eq!(bundle.thumbprint, FIXTURE_THUMBPRINT);
        assert!(bundle.has_private_key());
        assert_eq!(bundle.subject.common_name.as_deref(), Some("m365-admin-automation"));
    }
}

#[tokio::test]
async fn test_wrong_password() {
    let manager = CertificateManager::new();
    let err = manager
        .load_from_file(fixture("service-principal.pfx"), Some("not-the-password"))
        .await
        .unwrap_err();
    assert_eq!(err, CertificateError::InvalidPassword);
}

#[tokio::test]
async fn test_missing_file() {
    let manager = CertificateManager::new();
    let err = manager
        .load_from_file(fixture("does-not-exist.pfx"), Some(FIXTURE_PASSWORD))
        .await
        .unwrap_err();
    assert!(matches!(err, CertificateError::NotFound(_)));
}

#[tokio::test]
async fn test_certificate_only_files_give_info() {
    let manager = CertificateManager::new();

    let der = manager.get_info(fixture("service-principal.cer"), None).await.unwrap();
    assert_eq!(der.thumbprint, FIXTURE_THUMBPRINT);

    let pem = manager.get_info(fixture("cert.pem"), None).await.unwrap();
    assert_eq!(pem.thumbprint, FIXTURE_THUMBPRINT);
    assert_eq!(pem.subject.organization.as_deref(), Some("Contoso Ltd"));
    assert!(pem.is_valid);
}

#[tokio::test]
async fn test_validity_window_boundaries() {
    let manager = CertificateManager::new();
    let path = fixture("service-principal.pem");
    let not_after = Utc.with_ymd_and_hms(2124, 1, 1, 0, 0, 0).unwrap();
    let not_before = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    assert!(manager.validate_at(&path, None, not_before).await.unwrap());
    assert!(
        manager
            .validate_at(&path, None, not_after - chrono::Duration::seconds(1))
            .await
            .unwrap()
    );
    assert!(!manager.validate_at(&path, None, not_after).await.unwrap());
    assert!(
        !manager
            .validate_at(&path, None, not_before - chrono::Duration::seconds(1))
            .await
            .unwrap()
    );

    let info = manager
        .get_info_at(&path, None, not_after - chrono::Duration::days(10))
        .await
        .unwrap();
    assert_eq!(info.expires_in_days, 10);
}

#[tokio::test]
async fn test_expired_certificate() {
    let manager = CertificateManager::new();
    let info = manager.get_info(fixture("expired.pem"), None).await.unwrap();
    assert!(!info.is_valid);
    assert!(info.expires_in_days < 0);

    let bundle = manager.load_from_file(fixture("expired.pem"), None).await.unwrap();
    assert!(matches!(bundle.ensure_valid_at(Utc::now()), Err(CertificateError::Expired(_))));
}
