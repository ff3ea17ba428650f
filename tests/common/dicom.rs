//! Build real Part-10 DICOM byte streams for tests.

use dicom_core::header::DataElement;
use dicom_core::value::PrimitiveValue;
use dicom_core::VR;
use dicom_dictionary_std::{tags, uids};
use dicom_object::mem::InMemDicomObject;
use dicom_object::meta::FileMetaTableBuilder;

/// Write a complete Part-10 object (preamble, DICM magic, file meta,
/// data set) and return its exact bytes. `payload_len` bytes of pixel
/// data make the object arbitrarily large.
pub fn build_test_object(
    study_uid: &str,
    series_uid: &str,
    instance_uid: &str,
    modality: &str,
    payload_len: usize,
) -> Vec<u8> {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        PrimitiveValue::from(uids::CT_IMAGE_STORAGE),
    ));
    obj.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(instance_uid),
    ));
    obj.put(DataElement::new(
        tags::STUDY_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(study_uid),
    ));
    obj.put(DataElement::new(
        tags::SERIES_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(series_uid),
    ));
    obj.put(DataElement::new(
        tags::MODALITY,
        VR::CS,
        PrimitiveValue::from(modality),
    ));
    obj.put(DataElement::new(
        tags::PATIENT_ID,
        VR::LO,
        PrimitiveValue::from("PAT-001"),
    ));
    obj.put(DataElement::new(
        tags::ACCESSION_NUMBER,
        VR::SH,
        PrimitiveValue::from("ACC-001"),
    ));

    if payload_len > 0 {
        let payload: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
        obj.put(DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            PrimitiveValue::U8(payload.into()),
        ));
    }

    let file_obj = obj
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE),
        )
        .expect("file meta");

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("object.dcm");
    file_obj.write_to_file(&path).expect("write part 10");
    std::fs::read(&path).expect("read back")
}

/// The CT Image Storage SOP class used by every test object.
pub fn test_sop_class() -> &'static str {
    uids::CT_IMAGE_STORAGE
}

/// The transfer syntax every test object is written in.
pub fn test_transfer_syntax() -> &'static str {
    uids::EXPLICIT_VR_LITTLE_ENDIAN
}
