//! The healthcare reporting warehouse: 12 dimensions and 10 facts.
//!
//! Table and column names are the contract reporting tools query against;
//! keep them stable.

use crate::{
  catalog::{
    ColumnDef, DimensionDef, FactDef, FactKind, LateArrivalPolicy, Reference, ScdType,
    SchemaCatalog,
  },
  error::SchemaError,
  value::DataType::{Boolean, Date, Decimal, Integer, Text, Timestamp},
};

fn req(name: &str, t: crate::value::DataType) -> ColumnDef { ColumnDef::required(name, t) }

fn opt(name: &str, t: crate::value::DataType) -> ColumnDef { ColumnDef::nullable(name, t) }

/// Dimensions, in dependency order.
pub fn dimensions() -> Vec<DimensionDef> {
  vec![
    DimensionDef::new("DimDate", "DateKey", ScdType::None)
      .key("FullDate", Date)
      .column(req("Year", Integer))
      .column(req("Quarter", Integer))
      .column(req("Month", Integer))
      .column(req("DayOfWeek", Integer))
      .column(req("IsWeekend", Boolean))
      .column(opt("FiscalYear", Integer)),
    DimensionDef::new("DimFacility", "FacilityKey", ScdType::Type2)
      .key("FacilityID", Text)
      .column(req("FacilityName", Text))
      .column(opt("FacilityType", Text))
      .column(opt("City", Text))
      .column(opt("State", Text))
      .column(opt("LicensedBeds", Integer))
      .track(&["FacilityName", "FacilityType", "LicensedBeds"]),
    DimensionDef::new("DimUnit", "UnitKey", ScdType::Type1)
      .key("UnitID", Text)
      .column(req("UnitName", Text))
      .column(opt("UnitType", Text))
      .column(req("FacilityID", Text))
      .column(opt("StaffedBeds", Integer))
      .reference(Reference::mandatory("Facility", &["FacilityID"], "DimFacility")),
    DimensionDef::new("DimDepartment", "DepartmentKey", ScdType::Type1)
      .key("DepartmentID", Text)
      .column(req("DepartmentName", Text))
      .column(req("FacilityID", Text))
      .column(opt("CostCenter", Text))
      .reference(Reference::mandatory("Facility", &["FacilityID"], "DimFacility")),
    DimensionDef::new("DimServiceLine", "ServiceLineKey", ScdType::None)
      .key("ServiceLineID", Text)
      .column(req("ServiceLineName", Text))
      .column(opt("ServiceLineGroup", Text)),
    DimensionDef::new("DimPayer", "PayerKey", ScdType::None)
      .key("PayerID", Text)
      .column(req("PayerName", Text))
      .column(opt("PayerType", Text))
      .column(opt("FinancialClass", Text)),
    DimensionDef::new("DimPatient", "PatientKey", ScdType::Type2)
      .key("PatientID", Text)
      .column(opt("BirthDate", Date))
      .column(opt("Sex", Text))
      .column(opt("ZipCode", Text))
      .column(opt("PrimaryPayerID", Text))
      .track(&["ZipCode", "PrimaryPayerID"])
      .reference(Reference::optional("PrimaryPayer", &["PrimaryPayerID"], "DimPayer")),
    DimensionDef::new("DimProvider", "ProviderKey", ScdType::Type2)
      .key("ProviderID", Text)
      .column(req("ProviderName", Text))
      .column(opt("Specialty", Text))
      .column(opt("DepartmentID", Text))
      .track(&["Specialty", "DepartmentID"])
      .reference(Reference::optional("Department", &["DepartmentID"], "DimDepartment")),
    DimensionDef::new("DimDiagnosis", "DiagnosisKey", ScdType::None)
      .key("DiagnosisCode", Text)
      .column(req("Description", Text))
      .column(req("CodeSystem", Text)),
    DimensionDef::new("DimProcedure", "ProcedureKey", ScdType::None)
      .key("ProcedureCode", Text)
      .column(req("Description", Text))
      .column(req("CodeSystem", Text)),
    DimensionDef::new("DimJobCode", "JobCodeKey", ScdType::None)
      .key("JobCode", Text)
      .column(req("JobTitle", Text))
      .column(opt("IsNursing", Boolean)),
    DimensionDef::new("DimAppointmentType", "AppointmentTypeKey", ScdType::None)
      .key("AppointmentTypeID", Text)
      .column(req("AppointmentTypeName", Text))
      .column(opt("IsNewPatient", Boolean))
      .column(opt("DurationMinutes", Integer)),
  ]
}

/// Facts, each after the dimensions it references.
pub fn facts() -> Vec<FactDef> {
  vec![
    FactDef::new("FactCensusDaily", FactKind::Snapshot)
      .grain("CensusDate", Date)
      .grain("FacilityID", Text)
      .grain("UnitID", Text)
      .measure("OccupiedBeds", Integer)
      .measure("StaffedBeds", Integer)
      .measure("Admissions", Integer)
      .measure("Discharges", Integer)
      .reference(Reference::optional("CensusDate", &["CensusDate"], "DimDate"))
      .reference(Reference::mandatory("Facility", &["FacilityID"], "DimFacility"))
      .reference(Reference::mandatory("Unit", &["UnitID"], "DimUnit")),
    FactDef::new("FactRevenueDaily", FactKind::Snapshot)
      .grain("RevenueDate", Date)
      .grain("FacilityID", Text)
      .grain("DepartmentID", Text)
      .column(opt("ServiceLineID", Text))
      .measure("GrossCharges", Decimal)
      .measure("Adjustments", Decimal)
      .measure("NetRevenue", Decimal)
      .reference(Reference::optional("RevenueDate", &["RevenueDate"], "DimDate"))
      .reference(Reference::mandatory("Facility", &["FacilityID"], "DimFacility"))
      .reference(Reference::mandatory("Department", &["DepartmentID"], "DimDepartment"))
      .reference(Reference::optional("ServiceLine", &["ServiceLineID"], "DimServiceLine")),
    FactDef::new("FactARSnapshot", FactKind::Snapshot)
      .grain("SnapshotDate", Date)
      .grain("FacilityID", Text)
      .grain("PayerID", Text)
      .grain("AgingBucket", Text)
      .measure("ARBalance", Decimal)
      .measure("AccountCount", Integer)
      .reference(Reference::optional("SnapshotDate", &["SnapshotDate"], "DimDate"))
      .reference(Reference::mandatory("Facility", &["FacilityID"], "DimFacility"))
      .reference(Reference::mandatory("Payer", &["PayerID"], "DimPayer")),
    FactDef::new("FactTNA_Snapshot", FactKind::Snapshot)
      .grain("SnapshotDate", Date)
      .grain("ProviderID", Text)
      .grain("AppointmentTypeID", Text)
      .column(opt("DepartmentID", Text))
      .measure("DaysToThirdAvailable", Integer)
      .measure("OpenSlots", Integer)
      .reference(Reference::optional("SnapshotDate", &["SnapshotDate"], "DimDate"))
      .reference(Reference::mandatory("Provider", &["ProviderID"], "DimProvider"))
      .reference(Reference::mandatory(
        "AppointmentType",
        &["AppointmentTypeID"],
        "DimAppointmentType",
      ))
      .reference(Reference::optional("Department", &["DepartmentID"], "DimDepartment")),
    FactDef::new("FactStaffingDaily", FactKind::Snapshot)
      .grain("StaffingDate", Date)
      .grain("UnitID", Text)
      .grain("JobCode", Text)
      .measure("ScheduledHours", Decimal)
      .measure("WorkedHours", Decimal)
      .measure("OvertimeHours", Decimal)
      .measure("Headcount", Integer)
      .reference(Reference::optional("StaffingDate", &["StaffingDate"], "DimDate"))
      .reference(Reference::mandatory("Unit", &["UnitID"], "DimUnit"))
      .reference(Reference::mandatory("JobCode", &["JobCode"], "DimJobCode")),
    FactDef::new("FactQualityMeasureMonthly", FactKind::Snapshot)
      .grain("MeasureMonth", Date)
      .grain("FacilityID", Text)
      .grain("MeasureCode", Text)
      .column(opt("ServiceLineID", Text))
      .measure("Numerator", Integer)
      .measure("Denominator", Integer)
      .reference(Reference::optional("MeasureMonth", &["MeasureMonth"], "DimDate"))
      .reference(Reference::mandatory("Facility", &["FacilityID"], "DimFacility"))
      .reference(Reference::optional("ServiceLine", &["ServiceLineID"], "DimServiceLine")),
    FactDef::new("FactEncounter", FactKind::Event)
      .grain("EncounterID", Text)
      .column(req("PatientID", Text))
      .column(req("FacilityID", Text))
      .column(opt("DepartmentID", Text))
      .column(opt("AttendingProviderID", Text))
      .column(req("PayerID", Text))
      .column(opt("ServiceLineID", Text))
      .column(opt("PrimaryDiagnosisCode", Text))
      .column(req("EncounterType", Text))
      .column(req("AdmitTime", Timestamp))
      .column(opt("DischargeTime", Timestamp))
      .measure("LengthOfStayDays", Decimal)
      .measure("TotalCharges", Decimal)
      .reference(Reference::mandatory("Patient", &["PatientID"], "DimPatient"))
      .reference(Reference::mandatory("Facility", &["FacilityID"], "DimFacility"))
      .reference(Reference::optional("Department", &["DepartmentID"], "DimDepartment"))
      .reference(Reference::optional(
        "AttendingProvider",
        &["AttendingProviderID"],
        "DimProvider",
      ))
      .reference(Reference::mandatory("Payer", &["PayerID"], "DimPayer"))
      .reference(Reference::optional("ServiceLine", &["ServiceLineID"], "DimServiceLine"))
      .reference(Reference::optional(
        "PrimaryDiagnosis",
        &["PrimaryDiagnosisCode"],
        "DimDiagnosis",
      )),
    FactDef::new("FactEDVisit", FactKind::Event)
      .grain("EDVisitID", Text)
      .column(req("PatientID", Text))
      .column(req("FacilityID", Text))
      .column(opt("ProviderID", Text))
      .column(opt("PrimaryDiagnosisCode", Text))
      .column(opt("AcuityLevel", Integer))
      .column(opt("Disposition", Text))
      .column(req("ArrivalTime", Timestamp))
      .column(opt("DepartureTime", Timestamp))
      .measure("DoorToProviderMinutes", Decimal)
      .measure("LengthOfStayMinutes", Decimal)
      .reference(Reference::mandatory("Patient", &["PatientID"], "DimPatient"))
      .reference(Reference::mandatory("Facility", &["FacilityID"], "DimFacility"))
      .reference(Reference::optional("Provider", &["ProviderID"], "DimProvider"))
      .reference(Reference::optional(
        "PrimaryDiagnosis",
        &["PrimaryDiagnosisCode"],
        "DimDiagnosis",
      )),
    // Scheduling feeds routinely mention patients before registration does.
    FactDef::new("FactAppointment", FactKind::Event)
      .grain("AppointmentID", Text)
      .column(req("PatientID", Text))
      .column(req("ProviderID", Text))
      .column(req("DepartmentID", Text))
      .column(req("AppointmentTypeID", Text))
      .column(req("AppointmentDate", Date))
      .column(req("Status", Text))
      .measure("LeadTimeDays", Integer)
      .measure("DurationMinutes", Integer)
      .reference(Reference::mandatory("Patient", &["PatientID"], "DimPatient"))
      .reference(Reference::mandatory("Provider", &["ProviderID"], "DimProvider"))
      .reference(Reference::mandatory("Department", &["DepartmentID"], "DimDepartment"))
      .reference(Reference::mandatory(
        "AppointmentType",
        &["AppointmentTypeID"],
        "DimAppointmentType",
      ))
      .reference(Reference::optional("AppointmentDate", &["AppointmentDate"], "DimDate"))
      .late_arrival(LateArrivalPolicy::InferMember),
    FactDef::new("FactReadmission", FactKind::Event)
      .grain("ReadmissionID", Text)
      .column(req("IndexEncounterID", Text))
      .column(req("ReadmitEncounterID", Text))
      .column(req("PatientID", Text))
      .column(req("FacilityID", Text))
      .column(req("ReadmitDate", Date))
      .measure("DaysSinceDischarge", Integer)
      .reference(Reference::mandatory("Patient", &["PatientID"], "DimPatient"))
      .reference(Reference::mandatory("Facility", &["FacilityID"], "DimFacility"))
      .reference(Reference::optional("ReadmitDate", &["ReadmitDate"], "DimDate")),
  ]
}

/// The full warehouse catalog, frozen.
pub fn catalog() -> Result<SchemaCatalog, SchemaError> {
  let mut catalog = SchemaCatalog::new();
  for d in dimensions() {
    catalog.register_dimension(d)?;
  }
  for f in facts() {
    catalog.register_fact(f)?;
  }
  catalog.freeze();
  Ok(catalog)
}
